//! The single "a job is in flight" slot written at submission and cleared
//! when the client stops polling.

use crate::JobId;
use anyhow::{Context, Error};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait InFlightMarker: Send + Sync {
    async fn set(&self, job_id: JobId) -> Result<(), Error>;
    async fn clear(&self) -> Result<(), Error>;
    async fn get(&self) -> Result<Option<JobId>, Error>;
}

#[derive(Debug, Default)]
pub struct MemoryMarker {
    slot: Mutex<Option<JobId>>,
}

#[async_trait]
impl InFlightMarker for MemoryMarker {
    async fn set(&self, job_id: JobId) -> Result<(), Error> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(job_id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }

    async fn get(&self) -> Result<Option<JobId>, Error> {
        Ok(*self.slot.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Marker kept as a file holding the job id.
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMarker { path: path.into() }
    }
}

#[async_trait]
impl InFlightMarker for FileMarker {
    async fn set(&self, job_id: JobId) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, job_id.to_string())
            .await
            .with_context(|| format!("writing marker {}", self.path.display()))?;
        debug!(message = "Marker set", job_id = %job_id, path = %self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(err)
                .context(format!("removing marker {}", self.path.display()))),
        }
    }

    async fn get(&self) -> Result<Option<JobId>, Error> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents.trim().parse()?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
