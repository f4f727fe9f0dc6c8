use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub mod attach;
pub mod config;
pub mod db;
pub mod extract;
pub mod marker;
pub mod notice;
pub mod poller;
pub mod server;
pub mod task;
pub mod telemetry;
pub mod upload;
pub mod worker;

pub type JobId = Uuid;

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub files: Vec<PathBuf>,
}

impl JobRequest {
    pub fn file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }
}

/// Snapshot of an OCR job as stored by the server.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: Status,
    pub file_names: Vec<String>,
    pub processed_files: i32,
    pub total_files: i32,
    pub error_message: Option<String>,
    pub extracted_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Share of processed files, `0..=100`. A completed job always reports 100.
    pub fn progress_percent(&self) -> u8 {
        if self.status == Status::Completed {
            return 100;
        }
        if self.total_files <= 0 {
            return 0;
        }
        let processed = self.processed_files.clamp(0, self.total_files) as i64;
        (processed * 100 / self.total_files as i64) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ocr_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a loop treats an error from a lookup or status fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the loop and report the error.
    #[default]
    Abort,
    /// Count the attempt as not ready and keep going.
    Retry,
}
