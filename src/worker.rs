use crate::extract::{merge_extractions, Extractor};
use crate::{Job, JobId};
use anyhow::{anyhow, Error};
use async_channel::Receiver;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkMessage {
    JobStarted(JobId),
    FileProcessed(JobId, i32),
    JobCompleted(JobId, Value),
    JobFailed(JobId, String),
}

impl WorkMessage {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkMessage::JobStarted(id)
            | WorkMessage::FileProcessed(id, _)
            | WorkMessage::JobCompleted(id, _)
            | WorkMessage::JobFailed(id, _) => *id,
        }
    }
}

pub async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
    extractor: Arc<dyn Extractor>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(job) => {
                        let job_id = job.id;
                        if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
                            error!(message = "Server channel closed, exiting", job_id = %job_id);
                            break;
                        }
                        let response = match process(job, extractor.as_ref(), &send_to_server).await {
                            Ok(data) => WorkMessage::JobCompleted(job_id, data),
                            Err(err) => WorkMessage::JobFailed(job_id, err.to_string()),
                        };
                        if send_to_server.send(response).is_err() {
                            error!(message = "Server channel closed, exiting", job_id = %job_id);
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

/// Run every file of the job through the extractor. Files that fail are
/// skipped; the job only fails when none of them produced data.
#[instrument(skip_all, fields(job_id = %job.id, files = job.file_names.len()))]
async fn process(
    job: Job,
    extractor: &dyn Extractor,
    send_to_server: &UnboundedSender<WorkMessage>,
) -> Result<Value, Error> {
    let mut results = Vec::with_capacity(job.file_names.len());

    for (index, name) in job.file_names.iter().enumerate() {
        match extractor.extract(Path::new(name)).await {
            Ok(value) => results.push(value),
            Err(err) => warn!(message = "Skipping file", file = %name, error = ?err),
        }
        send_to_server
            .send(WorkMessage::FileProcessed(job.id, index as i32 + 1))
            .map_err(|_| anyhow!("server channel closed"))?;
    }

    if results.is_empty() {
        return Err(anyhow!("no data could be extracted"));
    }
    Ok(merge_extractions(&results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct NameExtractor;

    #[async_trait]
    impl Extractor for NameExtractor {
        async fn extract(&self, path: &Path) -> Result<Value, Error> {
            let name = path.to_string_lossy().into_owned();
            if name.starts_with("bad") {
                return Err(anyhow!("unreadable"));
            }
            let mut value = json!({ "first": name.clone() });
            value[name.as_str()] = json!(true);
            Ok(value)
        }
    }

    fn job(files: &[&str]) -> Job {
        Job {
            id: Uuid::new_v4(),
            status: Status::Processing,
            file_names: files.iter().map(|f| f.to_string()).collect(),
            processed_files: 0,
            total_files: files.len() as i32,
            error_message: None,
            extracted_data: None,
            created_at: Utc::now(),
        }
    }

    async fn run_one(job: Job) -> Vec<WorkMessage> {
        let cancel_token = CancellationToken::new();
        let (send_to_queue, recv_from_queue) = async_channel::bounded(1);
        let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel();
        let worker = tokio::spawn(start(
            cancel_token.clone(),
            recv_from_queue,
            send_to_server,
            Arc::new(NameExtractor),
        ));

        send_to_queue.send(job).await.unwrap();
        let mut messages = vec![];
        while let Some(message) = recv_from_worker.recv().await {
            let done = matches!(
                message,
                WorkMessage::JobCompleted(..) | WorkMessage::JobFailed(..)
            );
            messages.push(message);
            if done {
                break;
            }
        }
        cancel_token.cancel();
        worker.await.unwrap();
        messages
    }

    #[tokio::test]
    async fn skips_bad_files_and_merges_the_rest() {
        let job = job(&["a.jpg", "bad.jpg", "b.jpg"]);
        let id = job.id;
        let messages = run_one(job).await;

        assert_eq!(messages[0], WorkMessage::JobStarted(id));
        assert_eq!(messages[1], WorkMessage::FileProcessed(id, 1));
        assert_eq!(messages[2], WorkMessage::FileProcessed(id, 2));
        assert_eq!(messages[3], WorkMessage::FileProcessed(id, 3));
        match &messages[4] {
            WorkMessage::JobCompleted(job_id, data) => {
                assert_eq!(*job_id, id);
                assert_eq!(data["first"], "a.jpg");
                assert_eq!(data["b.jpg"], true);
                assert_eq!(data["source_count"], 2);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn fails_when_no_file_yields_data() {
        let job = job(&["bad1.png", "bad2.png"]);
        let id = job.id;
        let messages = run_one(job).await;

        assert_eq!(
            messages.last(),
            Some(&WorkMessage::JobFailed(id, "no data could be extracted".into()))
        );
    }
}
