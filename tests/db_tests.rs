//! Job store and dispatch loop against a live PostgreSQL. Skipped unless
//! `DATABASE_URL` is set.

use ocrjobs::db::DbHandle;
use ocrjobs::extract::FileMetadataExtractor;
use ocrjobs::server::{self, ServerConfig, WorkResponseMessage};
use ocrjobs::{Job, JobId, JobRequest, Status};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Claims and requeues touch every row, so tests sharing a database run one at a time.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn connect() -> Option<DbHandle> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(DbHandle::new(&url).await.unwrap())
}

fn request(files: &[&str]) -> JobRequest {
    JobRequest {
        files: files.iter().map(|name| PathBuf::from("/srv/scans").join(name)).collect(),
    }
}

async fn claim(handle: &DbHandle, owner: Uuid, id: JobId) -> Job {
    let claimed = handle.claim_pending_jobs(owner, 1000).await.unwrap();
    claimed
        .into_iter()
        .find(|job| job.id == id)
        .unwrap_or_else(|| panic!("job {id} was not claimed"))
}

#[tokio::test]
async fn claim_progress_complete_round_trip() {
    let Some(handle) = connect().await else { return };
    let _guard = DB_LOCK.lock().await;
    let owner = Uuid::new_v4();

    let id = handle.submit_job(&request(&["a.jpg", "b.png"])).await.unwrap();
    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Pending);
    assert_eq!(job.total_files, 2);
    assert_eq!(job.file_names, vec!["/srv/scans/a.jpg", "/srv/scans/b.png"]);

    let job = claim(&handle, owner, id).await;
    assert_eq!(job.status, Status::Processing);
    assert!(handle
        .claim_pending_jobs(Uuid::new_v4(), 1000)
        .await
        .unwrap()
        .iter()
        .all(|other| other.id != id));

    assert!(handle.record_progress(owner, id, 1).await.unwrap());
    assert_eq!(handle.get_job(id).await.unwrap().processed_files, 1);

    let data = json!({"address": "1-2-3 Chuo", "source_count": 2});
    assert!(handle.complete_job(owner, id, &data).await.unwrap());

    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.processed_files, 2);
    assert_eq!(job.extracted_data, Some(data));

    handle.delete_job(id).await.unwrap();
    assert!(handle.get_job(id).await.is_err());
}

#[tokio::test]
async fn failed_job_keeps_its_message() {
    let Some(handle) = connect().await else { return };
    let _guard = DB_LOCK.lock().await;
    let owner = Uuid::new_v4();

    let id = handle.submit_job(&request(&["c.pdf"])).await.unwrap();
    claim(&handle, owner, id).await;
    assert!(handle.fail_job(owner, id, "no data could be extracted").await.unwrap());

    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error_message.as_deref(), Some("no data could be extracted"));
    handle.delete_job(id).await.unwrap();
}

#[tokio::test]
async fn submission_enforces_upload_limits() {
    let Some(handle) = connect().await else { return };

    let names: Vec<String> = (0..11).map(|i| format!("scan-{i}.jpg")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    assert!(handle.submit_job(&request(&names)).await.is_err());
    assert!(handle.submit_job(&request(&["notes.txt"])).await.is_err());
    assert!(handle.submit_job(&request(&[])).await.is_err());
}

#[tokio::test]
async fn requeue_leaves_live_jobs_alone() {
    let Some(handle) = connect().await else { return };
    let _guard = DB_LOCK.lock().await;
    let owner = Uuid::new_v4();

    let id = handle.submit_job(&request(&["d.webp", "e.webp"])).await.unwrap();
    claim(&handle, owner, id).await;
    assert!(handle.record_progress(owner, id, 1).await.unwrap());
    assert!(handle.renew_leases(owner).await.unwrap() >= 1);

    // Another server starting up must not take over a job renewed just now.
    handle.requeue_stale_jobs(Duration::from_secs(3600)).await.unwrap();
    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Processing);
    assert_eq!(job.processed_files, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.requeue_stale_jobs(Duration::ZERO).await.unwrap() >= 1);
    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Pending);
    assert_eq!(job.processed_files, 0);
    handle.delete_job(id).await.unwrap();
}

#[tokio::test]
async fn results_from_a_server_that_lost_its_lease_are_dropped() {
    let Some(handle) = connect().await else { return };
    let _guard = DB_LOCK.lock().await;
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    let id = handle.submit_job(&request(&["f.png"])).await.unwrap();
    claim(&handle, first, id).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.requeue_stale_jobs(Duration::ZERO).await.unwrap();
    claim(&handle, second, id).await;

    assert!(!handle.record_progress(first, id, 1).await.unwrap());
    assert!(!handle.complete_job(first, id, &json!({})).await.unwrap());
    assert!(!handle.fail_job(first, id, "late").await.unwrap());
    assert_eq!(handle.get_job(id).await.unwrap().status, Status::Processing);

    assert!(handle.complete_job(second, id, &json!({"ok": true})).await.unwrap());
    assert_eq!(handle.get_job(id).await.unwrap().status, Status::Completed);
    handle.delete_job(id).await.unwrap();
}

#[tokio::test]
async fn server_processes_a_submitted_job() {
    let Some(handle) = connect().await else { return };
    let _guard = DB_LOCK.lock().await;

    let dir = tempfile::tempdir().unwrap();
    let files: Vec<PathBuf> = ["one.jpg", "two.pdf"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, b"scan").unwrap();
            path
        })
        .collect();

    let cancel = CancellationToken::new();
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();
    let config = ServerConfig {
        workers_count: 2,
        queue_check_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    };
    let server = tokio::spawn(server::serve(
        cancel.clone(),
        handle.clone(),
        config,
        Arc::new(FileMetadataExtractor),
        send_to_client,
    ));

    let id = handle.submit_job(&JobRequest { files }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = recv_from_server.recv().await {
            match message {
                WorkResponseMessage::JobCompleted(done) if done == id => return,
                WorkResponseMessage::JobFailed(failed, msg) if failed == id => panic!("job failed: {msg}"),
                _ => {}
            }
        }
        panic!("server stopped before finishing the job");
    })
    .await
    .unwrap();

    let job = handle.get_job(id).await.unwrap();
    assert_eq!(job.status, Status::Completed);
    assert_eq!(job.processed_files, 2);
    assert_eq!(job.extracted_data.unwrap()["source_count"], 2);

    cancel.cancel();
    server.await.unwrap().unwrap();
    handle.delete_job(id).await.unwrap();
}
