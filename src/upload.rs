//! Input files for a new job: upload limits, waiting for files to show up and
//! turning them into a request the server can resolve.

use crate::attach::{AttachCohort, AttachOutcome, RetryConfig, Target};
use crate::notice::Notifier;
use crate::JobRequest;
use anyhow::{bail, Context, Error};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

pub const MAX_FILES: usize = 10;
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const ACCEPTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "pdf"];

/// Limits that need no file access: at least one and at most [`MAX_FILES`]
/// files, each with an accepted extension.
pub fn check_limits(files: &[PathBuf]) -> Result<(), Error> {
    if files.is_empty() {
        bail!("a job needs at least one file");
    }
    if files.len() > MAX_FILES {
        bail!("too many files: {} given, at most {MAX_FILES} per job", files.len());
    }
    for path in files {
        let accepted = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ACCEPTED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)));
        if !accepted {
            bail!(
                "unsupported file type: {} (only PNG, JPG, JPEG, WEBP and PDF are accepted)",
                path.display()
            );
        }
    }
    Ok(())
}

/// Build a request from local files. Paths are made absolute so the server
/// resolves them regardless of its working directory.
pub async fn prepare(files: &[PathBuf]) -> Result<JobRequest, Error> {
    check_limits(files)?;

    let mut resolved = Vec::with_capacity(files.len());
    for path in files {
        let absolute = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("cannot resolve {}", path.display()))?;
        let metadata = tokio::fs::metadata(&absolute).await?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        if metadata.len() > MAX_FILE_BYTES {
            bail!(
                "file too large: {} is {} bytes, the limit is {MAX_FILE_BYTES}",
                path.display(),
                metadata.len()
            );
        }
        resolved.push(absolute);
    }

    Ok(JobRequest { files: resolved })
}

#[derive(Debug)]
pub struct FileWait {
    pub outcome: AttachOutcome,
    /// Files that showed up, in the order they were given.
    pub found: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

impl FileWait {
    /// Files worth submitting. `None` when the wait was cancelled, a lookup
    /// failed or nothing showed up.
    pub fn ready_files(&self) -> Option<&[PathBuf]> {
        match self.outcome {
            AttachOutcome::Cancelled { .. } | AttachOutcome::LookupFailed { .. } => None,
            _ if self.found.is_empty() => None,
            _ => Some(&self.found),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.found.is_empty() && !self.missing.is_empty()
    }
}

/// Wait for the input files to exist, with the readiness retry.
pub async fn wait_for_files(
    files: &[PathBuf],
    config: RetryConfig,
    notifier: Arc<dyn Notifier>,
    cancel_token: &CancellationToken,
) -> FileWait {
    let targets = files
        .iter()
        .map(|path| {
            let lookup_path = path.clone();
            let ready_path = path.clone();
            Target::new(
                path.display().to_string(),
                move || Ok(lookup_path.is_file()),
                move || debug!(message = "Input file ready", path = %ready_path.display()),
            )
        })
        .collect();

    let cohort = AttachCohort::new("input files", targets, config, notifier);
    let outcome = cohort.run_until(cancel_token).await;
    let (found, missing): (Vec<PathBuf>, Vec<PathBuf>) = files
        .iter()
        .cloned()
        .partition(|path| cohort.is_attached(&path.display().to_string()));

    debug!(
        message = "Input files checked",
        outcome = ?outcome,
        found = found.len(),
        missing = missing.len()
    );
    FileWait {
        outcome,
        found,
        missing,
    }
}
