//! Snapshot downloader tests against the in-memory hub

mod common;

use common::{COMMIT, MockHub, etag_of, layout, snapshot_downloader, wait_for};
use hub_cache::download::{JobState, SnapshotOptions, SnapshotRequest};
use hub_cache::error::HubError;
use hub_cache::repo::RepoRef;
use tempfile::TempDir;

const REPO: &str = "org/model";

fn repo() -> RepoRef {
    RepoRef::model(REPO).unwrap()
}

fn model_hub() -> std::sync::Arc<MockHub> {
    let hub = MockHub::new(REPO, COMMIT);
    hub.add_file("config.json", b"0123456789".to_vec());
    hub.add_file("weights.bin", vec![7u8; 1000]);
    hub
}

#[tokio::test]
async fn test_snapshot_end_to_end() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let job = snapshots.job(SnapshotRequest::new(repo()));
    let handle = job.handle();
    let dir = job.run().await.unwrap();

    assert_eq!(dir, layout(cache.path()).snapshot_dir(&repo(), COMMIT).unwrap());
    assert_eq!(std::fs::read(dir.join("config.json")).unwrap(), b"0123456789");
    assert_eq!(std::fs::read(dir.join("weights.bin")).unwrap(), vec![7u8; 1000]);
    let layout = layout(cache.path());
    assert_eq!(layout.read_ref(&repo(), "main").unwrap().as_deref(), Some(COMMIT));

    let mut blob_sizes: Vec<u64> = std::fs::read_dir(layout.blobs_dir(&repo()))
        .unwrap()
        .map(|entry| entry.unwrap().metadata().unwrap().len())
        .collect();
    blob_sizes.sort();
    assert_eq!(blob_sizes, vec![10, 1000]);

    for (name, content) in [("config.json", b"0123456789".to_vec()), ("weights.bin", vec![7u8; 1000])] {
        let blob = layout.blob_path(&repo(), &etag_of(&content)).unwrap();
        assert_eq!(
            dir.join(name).canonicalize().unwrap(),
            blob.canonicalize().unwrap(),
            "{name} should resolve to its blob"
        );
    }

    assert_eq!(handle.state(), JobState::Done);
    assert_eq!(handle.progress().total(), 1010);
    assert_eq!(handle.progress().completed(), 1010);
    assert!(snapshots.active_jobs().is_empty());
}

#[tokio::test]
async fn test_second_snapshot_download_transfers_nothing() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    snapshots.download(SnapshotRequest::new(repo())).await.unwrap();
    let gets = hub.total_get_count();
    snapshots.download(SnapshotRequest::new(repo())).await.unwrap();

    assert_eq!(hub.total_get_count(), gets);
    // File jobs are pinned to the commit, so existing pointers need no HEAD either
    assert_eq!(hub.head_count("weights.bin"), 1);
}

#[tokio::test]
async fn test_allow_and_ignore_patterns() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    hub.add_file("onnx/model.onnx", vec![1u8; 50]);
    hub.add_file("onnx/config.json", b"{}".to_vec());
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let mut request = SnapshotRequest::new(repo());
    request.allow_patterns = Some(vec!["*.json".to_string()]);
    request.ignore_patterns = Some(vec!["onnx/".to_string()]);
    let dir = snapshots.download(request).await.unwrap();

    assert!(dir.join("config.json").exists());
    assert!(!dir.join("onnx").exists());
    assert!(!dir.join("weights.bin").exists());
    assert_eq!(hub.get_count("weights.bin"), 0);
    assert_eq!(hub.get_count("onnx/config.json"), 0);
}

#[tokio::test]
async fn test_empty_selection_still_creates_snapshot_dir() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let mut request = SnapshotRequest::new(repo());
    request.allow_patterns = Some(vec!["*.nothing".to_string()]);
    let dir = snapshots.download(request).await.unwrap();

    assert!(dir.is_dir());
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    assert_eq!(hub.total_get_count(), 0);
}

#[tokio::test]
async fn test_invalid_pattern_leaves_no_ref() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let mut request = SnapshotRequest::new(repo());
    request.allow_patterns = Some(vec!["weights[".to_string()]);
    let result = snapshots.download(request).await;

    assert!(matches!(result, Err(HubError::InvalidPattern { .. })));
    assert_eq!(layout(cache.path()).read_ref(&repo(), "main").unwrap(), None);
}

#[tokio::test]
async fn test_first_failure_stops_remaining_files() {
    let cache = TempDir::new().unwrap();
    let hub = MockHub::new(REPO, COMMIT);
    for i in 1..=5 {
        hub.add_file(&format!("f{}.bin", i), vec![i as u8; 100]);
    }
    hub.forbid("f3.bin");

    let snapshots = snapshot_downloader(
        &hub,
        cache.path(),
        SnapshotOptions {
            max_workers: 1,
            accelerated_transfer: false,
        },
    );
    let job = snapshots.job(SnapshotRequest::new(repo()));
    let handle = job.handle();
    let result = job.run().await;

    match result {
        Err(HubError::FileJob {
            filename, source, ..
        }) => {
            assert_eq!(filename, "f3.bin");
            assert!(matches!(*source, HubError::Forbidden(_)));
        }
        other => panic!("expected a file job failure, got {:?}", other),
    }
    assert!(matches!(handle.state(), JobState::Failed { .. }));
    assert_eq!(hub.get_count("f1.bin"), 1);
    assert_eq!(hub.get_count("f2.bin"), 1);
    assert_eq!(hub.head_count("f4.bin"), 0);
    assert_eq!(hub.head_count("f5.bin"), 0);
}

#[tokio::test]
async fn test_transient_failures_do_not_fail_the_snapshot() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    hub.fail_get_transiently("weights.bin", 2);
    hub.fail_head_transiently("config.json", 1);
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let dir = snapshots.download(SnapshotRequest::new(repo())).await.unwrap();
    assert_eq!(std::fs::read(dir.join("weights.bin")).unwrap(), vec![7u8; 1000]);
    assert_eq!(hub.get_count("weights.bin"), 3);
}

#[tokio::test]
async fn test_accelerated_mode_runs_files_in_sequence() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(
        &hub,
        cache.path(),
        SnapshotOptions {
            max_workers: 8,
            accelerated_transfer: true,
        },
    );

    let dir = snapshots.download(SnapshotRequest::new(repo())).await.unwrap();
    assert!(dir.join("config.json").exists());
    assert!(dir.join("weights.bin").exists());
}

#[tokio::test]
async fn test_offline_snapshot_uses_cached_ref() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let mut offline = SnapshotRequest::new(repo());
    offline.local_files_only = true;
    assert!(matches!(
        snapshots.download(offline.clone()).await,
        Err(HubError::LocalEntryNotFound(_))
    ));
    assert_eq!(hub.info_count(), 0);

    let online = snapshots.download(SnapshotRequest::new(repo())).await.unwrap();
    let calls = hub.info_count();

    assert_eq!(snapshots.download(offline).await.unwrap(), online);
    assert_eq!(hub.info_count(), calls);
}

#[tokio::test]
async fn test_unknown_revision_is_reported() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let result = snapshots
        .download(SnapshotRequest::new(repo()).with_revision("v9.9"))
        .await;
    assert!(matches!(result, Err(HubError::RevisionNotFound { .. })));
}

#[tokio::test]
async fn test_pause_all_stops_running_snapshot() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    hub.stall_after("weights.bin", 512);
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let job = snapshots.job(SnapshotRequest::new(repo()));
    let handle = job.handle();
    let running = tokio::spawn(job.run());

    let progress = handle.progress();
    wait_for(|| progress.completed() >= 512).await;
    assert_eq!(snapshots.active_jobs().len(), 1);
    snapshots.pause_all();

    assert!(matches!(running.await.unwrap(), Err(HubError::Cancelled)));
    assert_eq!(handle.state(), JobState::Paused);
    assert!(snapshots.active_jobs().is_empty());

    // Resuming picks up the partial blob
    hub.clear_faults();
    let dir = snapshots.download(SnapshotRequest::new(repo())).await.unwrap();
    assert_eq!(std::fs::read(dir.join("weights.bin")).unwrap(), vec![7u8; 1000]);
    assert_eq!(
        hub.ranges("weights.bin").last().cloned().flatten().as_deref(),
        Some("bytes=512-")
    );
}

#[tokio::test]
async fn test_concurrent_jobs_for_same_revision_are_both_tracked() {
    let cache = TempDir::new().unwrap();
    let hub = model_hub();
    hub.stall_after("weights.bin", 512);
    let snapshots = snapshot_downloader(&hub, cache.path(), SnapshotOptions::default());

    let first = snapshots.job(SnapshotRequest::new(repo()));
    let second = snapshots.job(SnapshotRequest::new(repo()));
    let (first_handle, second_handle) = (first.handle(), second.handle());
    let first = tokio::spawn(first.run());
    let second = tokio::spawn(second.run());

    wait_for(|| snapshots.active_jobs().len() == 2).await;
    let progress = first_handle.progress();
    let other = second_handle.progress();
    wait_for(|| progress.completed() >= 512 || other.completed() >= 512).await;

    snapshots.pause_all();
    assert!(matches!(first.await.unwrap(), Err(HubError::Cancelled)));
    assert!(matches!(second.await.unwrap(), Err(HubError::Cancelled)));
    assert_eq!(first_handle.state(), JobState::Paused);
    assert_eq!(second_handle.state(), JobState::Paused);
    assert!(snapshots.active_jobs().is_empty());
}
