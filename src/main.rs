use anyhow::Error;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use ocrjobs::attach::AttachOutcome;
use ocrjobs::config::{Command, ConfigContext, PollArgs, WaitArgs};
use ocrjobs::db::DbHandle;
use ocrjobs::extract::FileMetadataExtractor;
use ocrjobs::marker::FileMarker;
use ocrjobs::notice::{ConsoleNotifier, Notice, Notifier};
use ocrjobs::poller::StatusPoller;
use ocrjobs::server::{self, ServerConfig, WorkResponseMessage};
use ocrjobs::{telemetry, upload};

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<ExitCode, Error> {
    let notifier: Arc<dyn Notifier> = Arc::new(ConsoleNotifier);

    match config.command.clone() {
        Command::Serve(args) => {
            let handle = DbHandle::new(&config.connect_url).await?;
            let (send_to_client, recv_from_server) = mpsc::unbounded_channel();
            let server_spawn = spawn_server(cancel_token.clone(), handle, args.config(), send_to_client);
            log_responses(cancel_token, recv_from_server).await;

            println!("Waiting for server to shutdown...");
            server_spawn.await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Submit(args) => {
            let handle = DbHandle::new(&config.connect_url).await?;
            submit_and_watch(
                &config,
                handle,
                args.files,
                args.no_wait,
                &args.poll,
                &args.wait,
                notifier,
                cancel_token,
            )
            .await
        }
        Command::Run(args) => {
            let handle = DbHandle::new(&config.connect_url).await?;
            let server_token = cancel_token.child_token();
            let (send_to_client, recv_from_server) = mpsc::unbounded_channel();
            let server_spawn = spawn_server(server_token.clone(), handle.clone(), args.serve.config(), send_to_client);
            let logger = tokio::spawn(log_responses(server_token.clone(), recv_from_server));

            let code = submit_and_watch(
                &config,
                handle,
                args.files,
                false,
                &args.poll,
                &args.wait,
                notifier,
                cancel_token,
            )
            .await;

            server_token.cancel();
            server_spawn.await?;
            logger.await?;
            code
        }
        Command::Status { job_id } => {
            let handle = DbHandle::new(&config.connect_url).await?;
            let job = handle.get_job(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::List { limit } => {
            let handle = DbHandle::new(&config.connect_url).await?;
            for job in handle.list_jobs(limit).await? {
                println!(
                    "{}  {:<10}  {:>3}/{:<3}  {}",
                    job.id,
                    job.status,
                    job.processed_files,
                    job.total_files,
                    job.created_at.to_rfc3339()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { job_id } => {
            let handle = DbHandle::new(&config.connect_url).await?;
            handle.delete_job(job_id).await?;
            println!("Deleted {job_id}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn spawn_server(
    cancel_token: CancellationToken,
    handle: DbHandle,
    config: ServerConfig,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            if let Err(err) = server::serve(
                cancel_token,
                handle,
                config,
                Arc::new(FileMetadataExtractor),
                send_to_client,
            )
            .await
            {
                error!("Error starting server: {}", err);
            }
        }
        .instrument(info_span!("server")),
    )
}

async fn log_responses(
    cancel_token: CancellationToken,
    mut recv_from_server: mpsc::UnboundedReceiver<WorkResponseMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(msg) => info!(event = "Message", msg = ?msg),
                    None => {
                        debug!("Server connection closed, exiting");
                        break;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_and_watch(
    config: &ConfigContext,
    handle: DbHandle,
    files: Vec<PathBuf>,
    no_wait: bool,
    poll: &PollArgs,
    wait: &WaitArgs,
    notifier: Arc<dyn Notifier>,
    cancel_token: CancellationToken,
) -> Result<ExitCode, Error> {
    if let Err(err) = upload::check_limits(&files) {
        error!(message = "Rejected input files", error = %err);
        eprintln!("{err}");
        return Ok(ExitCode::FAILURE);
    }

    let file_wait = upload::wait_for_files(&files, wait.config(), notifier.clone(), &cancel_token).await;
    let Some(ready) = file_wait.ready_files() else {
        match &file_wait.outcome {
            AttachOutcome::Cancelled { .. } => eprintln!("Cancelled while waiting for input files, nothing submitted"),
            AttachOutcome::LookupFailed { target, error, .. } => {
                eprintln!("Could not check {target}: {error}, nothing submitted")
            }
            _ => eprintln!("None of the input files exist, nothing submitted"),
        }
        return Ok(ExitCode::FAILURE);
    };
    if file_wait.is_partial() {
        warn!(message = "Submitting without missing files", missing = ?file_wait.missing);
        let missing: Vec<String> = file_wait.missing.iter().map(|path| path.display().to_string()).collect();
        eprintln!("Leaving out {} missing file(s): {}", missing.len(), missing.join(", "));
    }

    let request = match upload::prepare(ready).await {
        Ok(request) => request,
        Err(err) => {
            error!(message = "Rejected input files", error = %err);
            eprintln!("{err:#}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let marker = Arc::new(FileMarker::new(&config.marker_file));
    let poller = Arc::new(StatusPoller::new(Arc::new(handle), marker, poll.config()));
    let job_id = poller.submit(&request).await?;
    println!("Submitted job {job_id}");
    if no_wait {
        return Ok(ExitCode::SUCCESS);
    }

    let mut progress = poller.progress();
    let mut poll_task = poller.spawn(job_id);
    let result = loop {
        tokio::select! {
            joined = poll_task.join() => break joined?,
            _ = cancel_token.cancelled(), if !poll_task.is_cancelled() => poll_task.cancel(),
            Ok(()) = progress.changed() => {
                let current = progress.borrow_and_update().clone();
                if let Some(current) = current {
                    println!(
                        "[{:>3}] {}: {}/{} files ({}%)",
                        current.attempt, current.status, current.processed, current.total, current.percent
                    );
                }
            },
        }
    };

    match result {
        Ok(completion) => {
            println!(
                "Job {} completed in {:.1}s ({} files)",
                completion.job_id,
                completion.elapsed.as_secs_f64(),
                completion.total_files
            );
            if let Some(data) = completion.extracted_data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(message = "Polling stopped", error = %err);
            if let Some(notice) = Notice::from_poll_error(&err) {
                notifier.notify(notice);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(message = "Failed to install signal handlers", error = ?err);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    let code = app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(code)
}
