//! Downloads into the cache
//!
//! Provides functionality for:
//! - Single-file downloads with resume, dedup and cross-process locking
//! - Whole-snapshot downloads with bounded concurrency and fail-fast
//! - Job handles exposing state, progress, pause and cancel

pub mod file;
pub mod filter;
pub mod job;
pub mod progress;
pub mod snapshot;

pub use file::{DownloadOptions, FileDownloadRequest, FileDownloader, FileJob};
pub use filter::filter_repo_objects;
pub use job::{JobHandle, JobState, ResumeToken};
pub use progress::Progress;
pub use snapshot::{SnapshotDownloader, SnapshotJob, SnapshotOptions, SnapshotRequest};

use crate::error::{HubError, HubResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `future` unless `cancel` fires first
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = HubResult<T>>,
) -> HubResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HubError::Cancelled),
        result = future => result,
    }
}

/// Retry `op` on transient errors every `interval` until it succeeds, fails
/// for good, or `cancel` fires
pub(crate) async fn retry_transient<T, F, Fut>(
    repo_id: &str,
    interval: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HubResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }

        match op().await {
            Err(e) if e.is_transient() => {
                attempt += 1;
                tracing::warn!(
                    repo_id = %repo_id,
                    attempt,
                    retry_in_ms = interval.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                crate::metrics::record_transfer_retry(repo_id);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(HubError::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            other => return other,
        }
    }
}
