//! Advisory, crash-tolerant file lock keyed by path
//!
//! Exclusion comes from the OS lock primitive (`flock` / `LockFileEx` via
//! `fs2`), never from the mere existence of the lock file. A holder that
//! crashes leaves its file behind but the OS drops the lock with the process,
//! so stale lock files are simply reopened and locked again.

use crate::error::{HubError, HubResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Longest single sleep between acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Exclusive lock on a lock file
///
/// Not reentrant: a second `FileLock` for the same path blocks even inside the
/// same process. Waiters are not ordered. The lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    poll_interval: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    /// Override the maximum sleep between attempts
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Try to take the lock without waiting
    pub fn try_acquire(&mut self) -> HubResult<bool> {
        if self.file.is_some() {
            return Ok(true);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // A releasing holder unlinks the file after unlocking; if we locked the
        // unlinked inode, reopen the path and try again.
        for _ in 0..3 {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&self.path)?;

            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }

            if still_linked(&file, &self.path) {
                self.file = Some(file);
                return Ok(true);
            }
            let _ = FileExt::unlock(&file);
        }

        Ok(false)
    }

    /// Wait for the lock, polling every `min(poll_interval, remaining)`
    ///
    /// Without a timeout the wait is unbounded. Cancellation is checked before
    /// every attempt and interrupts the sleep between attempts.
    pub async fn acquire(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> HubResult<()> {
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(HubError::Cancelled);
            }

            if self.try_acquire()? {
                tracing::debug!(path = ?self.path, "Lock acquired");
                return Ok(());
            }

            let wait = match timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(HubError::LockTimeout {
                            path: self.path.clone(),
                            timeout,
                        });
                    }
                    (timeout - elapsed).min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            tracing::debug!(path = ?self.path, wait_ms = wait.as_millis() as u64, "Lock busy, waiting");

            tokio::select! {
                _ = cancel.cancelled() => return Err(HubError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Release the lock and remove the lock file (best effort)
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(path = ?self.path, error = %e, "Failed to unlock");
        }
        drop(file);

        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = ?self.path, error = %e, "Could not remove lock file");
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}
