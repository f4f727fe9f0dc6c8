use ocrjobs::attach::{AttachOutcome, RetryConfig};
use ocrjobs::notice::{Notice, RecordingNotifier};
use ocrjobs::upload::{self, MAX_FILES, MAX_FILE_BYTES};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

fn wait_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        delay: Duration::from_millis(300),
        ..RetryConfig::default()
    }
}

#[test]
fn empty_file_list_is_rejected() {
    let err = upload::check_limits(&[]).unwrap_err();
    assert!(err.to_string().contains("at least one file"), "{err}");
}

#[test]
fn more_than_ten_files_are_rejected() {
    let ten: Vec<PathBuf> = (0..MAX_FILES).map(|i| format!("scan-{i}.jpg").into()).collect();
    upload::check_limits(&ten).unwrap();

    let eleven: Vec<PathBuf> = (0..=MAX_FILES).map(|i| format!("scan-{i}.jpg").into()).collect();
    let err = upload::check_limits(&eleven).unwrap_err();
    assert!(err.to_string().contains("too many files"), "{err}");
}

#[test]
fn only_image_and_pdf_types_are_accepted() {
    upload::check_limits(&paths(&["a.jpg", "b.JPEG", "c.png", "d.webp", "e.Pdf"])).unwrap();

    for bad in ["notes.txt", "archive.tar.gz", "scan", "photo.heic"] {
        let err = upload::check_limits(&paths(&["ok.png", bad])).unwrap_err();
        assert!(err.to_string().contains("unsupported file type"), "{bad}: {err}");
        assert!(err.to_string().contains(bad), "{bad}: {err}");
    }
}

#[tokio::test]
async fn oversized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let small = dir.path().join("small.png");
    let large = dir.path().join("large.pdf");
    std::fs::write(&small, b"png").unwrap();
    std::fs::File::create(&large)
        .unwrap()
        .set_len(MAX_FILE_BYTES + 1)
        .unwrap();

    let err = upload::prepare(&[small.clone(), large]).await.unwrap_err();
    assert!(err.to_string().contains("file too large"), "{err}");

    let exactly_at_limit = dir.path().join("limit.pdf");
    std::fs::File::create(&exactly_at_limit)
        .unwrap()
        .set_len(MAX_FILE_BYTES)
        .unwrap();
    upload::prepare(&[small, exactly_at_limit]).await.unwrap();
}

#[tokio::test]
async fn relative_paths_are_submitted_as_absolute() {
    let file = tempfile::Builder::new()
        .suffix(".jpg")
        .tempfile_in(".")
        .unwrap();
    let name = file.path().file_name().unwrap().to_owned();
    let relative = PathBuf::from(&name);
    assert!(relative.is_relative());

    let request = upload::prepare(&[relative]).await.unwrap();

    assert_eq!(request.files.len(), 1);
    assert!(request.files[0].is_absolute(), "{:?}", request.files[0]);
    assert_eq!(request.files[0], std::fs::canonicalize(file.path()).unwrap());
    assert!(request.file_names()[0].ends_with(name.to_str().unwrap()));
}

#[tokio::test]
async fn missing_file_cannot_be_prepared() {
    let dir = tempfile::tempdir().unwrap();
    let err = upload::prepare(&[dir.path().join("gone.png")]).await.unwrap_err();
    assert!(err.to_string().contains("cannot resolve"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn file_written_late_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let early = dir.path().join("early.png");
    let late = dir.path().join("late.png");
    std::fs::write(&early, b"png").unwrap();

    let writer = {
        let late = late.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            std::fs::write(late, b"png").unwrap();
        })
    };

    let notifier = Arc::new(RecordingNotifier::default());
    let wait = upload::wait_for_files(
        &[early.clone(), late.clone()],
        wait_config(5),
        notifier.clone(),
        &CancellationToken::new(),
    )
    .await;
    writer.await.unwrap();

    assert_eq!(wait.outcome, AttachOutcome::Attached { attempts: 3 });
    assert_eq!(wait.ready_files(), Some(&[early, late][..]));
    assert!(!wait.is_partial());
    assert!(notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_wait_lists_the_files_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.jpg");
    let absent = dir.path().join("absent.jpg");
    std::fs::write(&present, b"jpg").unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let wait = upload::wait_for_files(
        &[absent.clone(), present.clone()],
        wait_config(5),
        notifier.clone(),
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(wait.outcome, AttachOutcome::Exhausted { attempts: 5, .. }), "{:?}", wait.outcome);
    assert!(wait.is_partial());
    assert_eq!(wait.ready_files(), Some(&[present][..]));
    assert_eq!(wait.missing, vec![absent]);
    // Suppressed for a partial cohort; the caller lists the missing files.
    assert!(notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn nothing_found_is_not_submittable() {
    let dir = tempfile::tempdir().unwrap();
    let absent = dir.path().join("absent.webp");

    let notifier = Arc::new(RecordingNotifier::default());
    let wait = upload::wait_for_files(
        &[absent.clone()],
        wait_config(2),
        notifier.clone(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(wait.ready_files(), None);
    assert_eq!(
        notifier.notices(),
        vec![Notice::SetupFailed {
            cohort: "input files".to_string(),
            missing: vec![absent.display().to_string()],
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_submits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.pdf");
    let absent = dir.path().join("absent.pdf");
    std::fs::write(&present, b"pdf").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let wait = upload::wait_for_files(
        &[present.clone(), absent],
        wait_config(5),
        Arc::new(RecordingNotifier::default()),
        &cancel,
    )
    .await;

    assert_eq!(wait.outcome, AttachOutcome::Cancelled { attempts: 1 });
    assert_eq!(wait.found, vec![present]);
    assert_eq!(wait.ready_files(), None);
}
