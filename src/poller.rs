//! Bounded status poller: follows a submitted job to a terminal state at a
//! fixed interval, giving up after a fixed number of checks.

use crate::marker::InFlightMarker;
use crate::notice::FAILED_FALLBACK;
use crate::task::TaskHandle;
use crate::{ErrorPolicy, Job, JobId, JobRequest, Status};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Client view of the job service.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<JobId, anyhow::Error>;
    async fn status(&self, job_id: JobId) -> Result<Job, anyhow::Error>;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub on_fetch_error: ErrorPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_millis(1000),
            max_attempts: 120,
            on_fetch_error: ErrorPolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub attempt: u32,
    pub status: Status,
    pub processed: i32,
    pub total: i32,
    pub percent: u8,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub attempts: u32,
    pub total_files: i32,
    pub extracted_data: Option<serde_json::Value>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("job {job_id} failed: {message}")]
    Failed { job_id: JobId, message: String },

    #[error("job {job_id} did not finish within {attempts} status checks")]
    TimedOut { job_id: JobId, attempts: u32 },

    #[error("status check {attempt} for job {job_id} failed: {source}")]
    Transport {
        job_id: JobId,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("polling job {job_id} was cancelled after {attempts} status checks")]
    Cancelled { job_id: JobId, attempts: u32 },
}

pub struct StatusPoller {
    api: Arc<dyn JobApi>,
    marker: Arc<dyn InFlightMarker>,
    config: PollConfig,
    progress: watch::Sender<Option<Progress>>,
}

impl StatusPoller {
    pub fn new(api: Arc<dyn JobApi>, marker: Arc<dyn InFlightMarker>, config: PollConfig) -> Self {
        let (progress, _) = watch::channel(None);
        StatusPoller {
            api,
            marker,
            config,
            progress,
        }
    }

    /// Latest progress published by [`StatusPoller::wait`].
    pub fn progress(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.subscribe()
    }

    /// Submit a job and remember it as in flight.
    #[instrument(skip_all, fields(files = request.files.len()))]
    pub async fn submit(&self, request: &JobRequest) -> Result<JobId, anyhow::Error> {
        let job_id = self.api.submit(request).await?;
        self.marker.set(job_id).await?;
        info!(message = "Job submitted", job_id = %job_id);
        Ok(job_id)
    }

    pub fn spawn(self: &Arc<Self>, job_id: JobId) -> TaskHandle<Result<Completion, PollError>> {
        let poller = Arc::clone(self);
        TaskHandle::spawn(info_span!("poll", job_id = %job_id), move |cancel| async move {
            poller.wait(job_id, &cancel).await
        })
    }

    /// Poll until the job is terminal, the budget runs out or `cancel` fires.
    /// The in-flight marker is cleared on every exit.
    pub async fn wait(&self, job_id: JobId, cancel: &CancellationToken) -> Result<Completion, PollError> {
        let result = self.poll(job_id, cancel).await;
        if let Err(err) = self.marker.clear().await {
            warn!(message = "Failed to clear in-flight marker", job_id = %job_id, error = ?err);
        }
        result
    }

    async fn poll(&self, job_id: JobId, cancel: &CancellationToken) -> Result<Completion, PollError> {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let interval = self.config.interval.max(Duration::from_millis(1));

        // First check one interval after submission. A slow fetch delays the
        // next tick instead of overlapping it.
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(message = "Polling cancelled", job_id = %job_id, attempt);
                    return Err(PollError::Cancelled { job_id, attempts: attempt - 1 });
                },
                _ = ticker.tick() => {},
            }

            let job = match self.api.status(job_id).await {
                Ok(job) => job,
                Err(err) => match self.config.on_fetch_error {
                    ErrorPolicy::Abort => {
                        error!(message = "Status check failed", job_id = %job_id, attempt, error = ?err);
                        return Err(PollError::Transport {
                            job_id,
                            attempt,
                            source: err,
                        });
                    }
                    ErrorPolicy::Retry => {
                        warn!(message = "Status check failed, retrying", job_id = %job_id, attempt, error = ?err);
                        continue;
                    }
                },
            };

            let progress = self.publish(attempt, &job, started.elapsed());
            debug!(
                message = "Poll",
                job_id = %job_id,
                attempt,
                status = %job.status,
                processed = progress.processed,
                total = progress.total,
                eta = ?progress.eta
            );

            match job.status {
                Status::Completed => {
                    info!(message = "Job completed", job_id = %job_id, attempts = attempt);
                    return Ok(Completion {
                        job_id,
                        attempts: attempt,
                        total_files: job.total_files,
                        extracted_data: job.extracted_data,
                        elapsed: started.elapsed(),
                    });
                }
                Status::Failed => {
                    let message = job
                        .error_message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| FAILED_FALLBACK.to_string());
                    warn!(message = "Job failed", job_id = %job_id, attempts = attempt, error = %message);
                    return Err(PollError::Failed { job_id, message });
                }
                Status::Pending | Status::Processing => {}
            }
        }

        warn!(message = "Polling timed out", job_id = %job_id, attempts = max_attempts);
        Err(PollError::TimedOut {
            job_id,
            attempts: max_attempts,
        })
    }

    fn publish(&self, attempt: u32, job: &Job, elapsed: Duration) -> Progress {
        let total = job.total_files.max(0);
        let processed = if job.status == Status::Completed {
            total
        } else {
            job.processed_files.clamp(0, total)
        };
        let eta = (processed > 0 && processed < total)
            .then(|| elapsed.mul_f64((total - processed) as f64 / processed as f64));

        let progress = Progress {
            attempt,
            status: job.status,
            processed,
            total,
            percent: job.progress_percent(),
            eta,
        };
        self.progress.send_replace(Some(progress.clone()));
        progress
    }
}
