use crate::db::DbHandle;
use crate::extract::Extractor;
use crate::worker::{self, WorkMessage};
use crate::{Job, JobId};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobCompleted(JobId),
    JobFailed(JobId, String),
    DatabaseQueueError(Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub workers_count: u16,
    pub queue_check_interval: Duration,
    /// Owner written on every claimed job.
    pub server_id: Uuid,
    /// A `processing` job not renewed for this long is requeued by any server.
    pub lease: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            workers_count: 3,
            queue_check_interval: Duration::from_millis(500),
            server_id: Uuid::new_v4(),
            lease: Duration::from_secs(30),
        }
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    handle: DbHandle,
    config: ServerConfig,
    extractor: Arc<dyn Extractor>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    let workers_count = config.workers_count.max(1);
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let extractor = extractor.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, recv_from_queue, send_to_server, extractor).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let mut free_workers = workers_count as i64;
    let server_id = config.server_id;
    let lease = config.lease.max(Duration::from_secs(1));
    info!(message = "Server started", server_id = %server_id, workers = workers_count, lease = ?lease);

    let requeued = handle.requeue_stale_jobs(lease).await?;
    if requeued > 0 {
        info!(message = "Requeued interrupted jobs", count = requeued);
    }

    let mut queue_check = tokio::time::interval(config.queue_check_interval.max(Duration::from_millis(10)));
    queue_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval(lease / 3);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if free_workers > 0 {
            match handle.claim_pending_jobs(server_id, free_workers).await {
                Ok(jobs_to_process) => {
                    for job in jobs_to_process {
                        debug!(message = "Dispatching job", job_id = %job.id, files = job.total_files);
                        send_to_queue.send(job).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => {
                    if send_to_client.send(WorkResponseMessage::DatabaseQueueError(err)).is_err() {
                        error!("Failed to send response to client");
                        cancel_token.cancel();
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            _ = queue_check.tick() => {},
            _ = heartbeat.tick() => {
                // Renew first so this server's own jobs never look stale.
                let result = match handle.renew_leases(server_id).await {
                    Ok(_) => handle.requeue_stale_jobs(lease).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(0) => {},
                    Ok(requeued) => info!(message = "Requeued stale jobs", count = requeued),
                    Err(err) => {
                        if send_to_client.send(WorkResponseMessage::DatabaseQueueError(err)).is_err() {
                            error!("Failed to send response to client");
                            cancel_token.cancel();
                            break;
                        }
                    }
                }
            },
            chan_msg = recv_from_worker.recv() => {
                let Some(message) = chan_msg else {
                    debug!("Worker channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };

                let job_id = message.job_id();
                let (result, response) = match message {
                    WorkMessage::JobStarted(job_id) => {
                        debug!(message = "Starting job", job_id = %job_id);
                        (Ok(true), None)
                    },
                    WorkMessage::FileProcessed(job_id, processed) => {
                        trace!(message = "File processed", job_id = %job_id, processed);
                        (handle.record_progress(server_id, job_id, processed).await, None)
                    },
                    WorkMessage::JobCompleted(job_id, data) => {
                        debug!(message = "Completed job", job_id = %job_id);
                        free_workers += 1;
                        (handle.complete_job(server_id, job_id, &data).await, Some(WorkResponseMessage::JobCompleted(job_id)))
                    },
                    WorkMessage::JobFailed(job_id, error_msg) => {
                        debug!(message = "Failed job", job_id = %job_id, error = %error_msg);
                        free_workers += 1;
                        let result = handle.fail_job(server_id, job_id, &error_msg).await;
                        (result, Some(WorkResponseMessage::JobFailed(job_id, error_msg)))
                    },
                };

                let response = match result {
                    Ok(true) => response,
                    Ok(false) => {
                        warn!(message = "Job no longer held by this server, dropping result", job_id = %job_id);
                        None
                    },
                    Err(err) => {
                        if send_to_client.send(WorkResponseMessage::DatabaseQueueError(err)).is_err() {
                            error!("Failed to send response to client");
                            cancel_token.cancel();
                            break;
                        }
                        response
                    },
                };
                if let Some(response) = response {
                    if send_to_client.send(response).is_err() {
                        error!("Failed to send response to client");
                        cancel_token.cancel();
                        break;
                    }
                }
            },
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}
