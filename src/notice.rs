use crate::poller::PollError;
use crate::JobId;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, warn};

/// Fallback text when the server marks a job failed without a message.
pub const FAILED_FALLBACK: &str = "OCR processing failed";

/// A user-facing notice raised at the end of a retry or poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SetupFailed { cohort: String, missing: Vec<String> },
    JobFailed { job_id: JobId, message: String },
    JobTimedOut { job_id: JobId, attempts: u32 },
    JobUnreachable { job_id: JobId, message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SetupFailed { cohort, missing } => write!(
                f,
                "{cohort} could not be initialised (missing: {}). Please reload and try again.",
                missing.join(", ")
            ),
            Notice::JobFailed { message, .. } => f.write_str(message),
            Notice::JobTimedOut { attempts, .. } => {
                write!(f, "OCR processing timed out after {attempts} status checks")
            }
            Notice::JobUnreachable { message, .. } => {
                write!(f, "Lost contact with the OCR job: {message}")
            }
        }
    }
}

impl Notice {
    /// Notice for a poll that ended without a result. `None` for cancellation,
    /// which the caller asked for.
    pub fn from_poll_error(err: &PollError) -> Option<Notice> {
        match err {
            PollError::Failed { job_id, message } => Some(Notice::JobFailed {
                job_id: *job_id,
                message: message.clone(),
            }),
            PollError::TimedOut { job_id, attempts } => Some(Notice::JobTimedOut {
                job_id: *job_id,
                attempts: *attempts,
            }),
            PollError::Transport { job_id, source, .. } => Some(Notice::JobUnreachable {
                job_id: *job_id,
                message: source.to_string(),
            }),
            PollError::Cancelled { .. } => None,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the terminal and the log.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::SetupFailed { cohort, missing } => {
                warn!(message = "Setup failed", cohort = %cohort, missing = ?missing)
            }
            other => error!(message = "Job did not complete", notice = ?other),
        }
        eprintln!("{notice}");
    }
}

/// Keeps every notice in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notice);
    }
}
