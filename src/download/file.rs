//! Single-file downloads
//!
//! A file job resolves transfer metadata, short-circuits on an existing
//! pointer or blob, then takes the per-blob lock and streams the content into
//! `blobs/<etag>.incomplete`. The partial file is the resume token: a later
//! job continues from its length with a `Range` request. Completed blobs are
//! renamed into place and linked from `snapshots/<commit>/<filename>`.

use super::job::{JobHandle, ResumeToken};
use super::progress::Progress;
use super::{JobState, cancellable, retry_transient};
use crate::cache::{CacheLayout, CachedLookup, Linker, validate_filename};
use crate::error::{ErrorContext, HubError, HubResult};
use crate::hub::{DEFAULT_REVISION, FileMetadata, HubApi};
use crate::lock::{FileLock, LOCK_POLL_INTERVAL};
use crate::repo::{RepoRef, is_commit_hash};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, HeaderValue, RANGE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Fixed wait between attempts after a transient failure
    pub retry_interval: Duration,
    /// Give up waiting for a blob lock after this long; `None` waits forever
    pub lock_timeout: Option<Duration>,
    pub lock_poll_interval: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            lock_timeout: None,
            lock_poll_interval: LOCK_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileDownloadRequest {
    pub repo: RepoRef,
    pub filename: String,
    /// Branch, tag or commit; the default branch when `None`
    pub revision: Option<String>,
    pub force_download: bool,
    /// Never touch the network
    pub local_files_only: bool,
}

impl FileDownloadRequest {
    pub fn new(repo: RepoRef, filename: impl Into<String>) -> Self {
        Self {
            repo,
            filename: filename.into(),
            revision: None,
            force_download: false,
            local_files_only: false,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(DEFAULT_REVISION)
    }
}

/// Downloads files of any repository into one cache root
#[derive(Clone)]
pub struct FileDownloader {
    api: Arc<HubApi>,
    layout: CacheLayout,
    linker: Arc<Linker>,
    options: DownloadOptions,
}

impl FileDownloader {
    pub fn new(api: Arc<HubApi>, cache_dir: impl Into<PathBuf>, options: DownloadOptions) -> Self {
        Self {
            api,
            layout: CacheLayout::new(cache_dir),
            linker: Arc::new(Linker::new()),
            options,
        }
    }

    /// Share a linker, and its per-root strategy cache, between downloaders
    pub fn with_linker(mut self, linker: Arc<Linker>) -> Self {
        self.linker = linker;
        self
    }

    pub fn api(&self) -> &Arc<HubApi> {
        &self.api
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Create a job; nothing happens until [`FileJob::run`]
    pub fn job(&self, request: FileDownloadRequest) -> FileJob {
        self.nested_job(request, JobHandle::new(Progress::root(0)))
    }

    pub(crate) fn nested_job(&self, request: FileDownloadRequest, handle: JobHandle) -> FileJob {
        FileJob {
            downloader: self.clone(),
            request,
            handle,
        }
    }

    /// Download one file and return its snapshot path
    pub async fn download(&self, request: FileDownloadRequest) -> HubResult<PathBuf> {
        self.job(request).run().await
    }
}

pub struct FileJob {
    downloader: FileDownloader,
    request: FileDownloadRequest,
    handle: JobHandle,
}

impl FileJob {
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn request(&self) -> &FileDownloadRequest {
        &self.request
    }

    pub async fn run(self) -> HubResult<PathBuf> {
        let result = self.execute().await;
        self.handle.finish(&result);

        let repo_id = &self.request.repo.id;
        let filename = &self.request.filename;
        match &result {
            Ok(path) => {
                tracing::debug!(repo_id = %repo_id, filename = %filename, path = ?path, "File ready");
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(repo_id = %repo_id, filename = %filename, state = ?self.handle.state(), "File download stopped");
            }
            Err(e) => {
                tracing::warn!(repo_id = %repo_id, filename = %filename, error = %e, "File download failed");
            }
        }
        result
    }

    async fn execute(&self) -> HubResult<PathBuf> {
        let request = &self.request;
        let repo = &request.repo;
        let filename = request.filename.as_str();
        let revision = request.revision();
        let layout = &self.downloader.layout;

        validate_filename(filename)?;

        if request.local_files_only {
            return self.local_lookup(revision);
        }

        // A commit never moves: what the cache knows about it is final
        if is_commit_hash(revision) && !request.force_download {
            self.handle.set_state(JobState::CheckPointerOrBlobExists);
            match layout.lookup(repo, revision, filename)? {
                CachedLookup::Found(pointer) => {
                    crate::metrics::record_dedup_hit("pointer");
                    self.handle.progress().mark_complete();
                    return Ok(pointer);
                }
                CachedLookup::KnownMissing { commit_hash } => {
                    return Err(self.entry_not_found(Some(commit_hash)));
                }
                CachedLookup::NotCached => {}
            }
        }

        self.handle.set_state(JobState::ResolvingMetadata);
        let metadata = match self.resolve_metadata(revision).await {
            Ok(metadata) => metadata,
            Err(HubError::EntryNotFound {
                commit_hash: Some(commit_hash),
                ..
            }) => {
                layout.mark_missing(repo, &commit_hash, filename)?;
                // Refs may only name commits that have a snapshot
                if layout.snapshot_dir(repo, &commit_hash)?.is_dir() {
                    layout.write_ref(repo, revision, &commit_hash)?;
                }
                return Err(self.entry_not_found(Some(commit_hash)));
            }
            Err(e) => return Err(e),
        };

        let (commit_hash, etag, size) = match (metadata.commit_hash, metadata.etag, metadata.size) {
            (Some(commit), Some(etag), Some(size)) => (commit, etag, size),
            (None, _, _) => return Err(self.not_reproducible("commit hash")),
            (_, None, _) => return Err(self.not_reproducible("ETag")),
            (_, _, None) => return Err(self.not_reproducible("size")),
        };

        let blob = layout.blob_path(repo, &etag)?;
        let pointer = layout.pointer_path(repo, &commit_hash, filename)?;
        let progress = self.handle.progress();
        progress.set_total(size);

        self.handle.set_state(JobState::CheckPointerOrBlobExists);
        if !request.force_download {
            if pointer.exists() {
                layout.write_ref(repo, revision, &commit_hash)?;
                crate::metrics::record_dedup_hit("pointer");
                progress.mark_complete();
                return Ok(pointer);
            }
            if blob.exists() {
                self.link(&blob, &pointer, false).await?;
                layout.write_ref(repo, revision, &commit_hash)?;
                crate::metrics::record_dedup_hit("blob");
                progress.mark_complete();
                return Ok(pointer);
            }
        }

        self.handle.set_state(JobState::AcquiringLock);
        let options = &self.downloader.options;
        let mut lock = FileLock::new(layout.lock_path(repo, &etag)?)
            .with_poll_interval(options.lock_poll_interval);
        lock.acquire(options.lock_timeout, self.handle.token()).await?;

        // Another process may have finished the blob while we waited
        if !request.force_download && blob.exists() {
            self.link(&blob, &pointer, false).await?;
            lock.release();
            layout.write_ref(repo, revision, &commit_hash)?;
            crate::metrics::record_dedup_hit("blob");
            progress.mark_complete();
            return Ok(pointer);
        }

        let blobs_dir = layout.blobs_dir(repo);
        tokio::fs::create_dir_all(&blobs_dir).await?;
        let incomplete = layout.incomplete_path(repo, &etag)?;
        if request.force_download {
            remove_partial(&incomplete).await?;
        }
        warn_if_low_space(&[blobs_dir.as_path(), pointer.as_path()], size);

        self.handle.set_state(JobState::Transferring);
        tracing::info!(
            repo_id = %repo.id,
            filename = %filename,
            commit = %commit_hash,
            size,
            "Downloading file"
        );

        if let Err(e) = self.transfer(&metadata.location, &incomplete, size).await {
            if e.is_cancelled() {
                self.stop_partial(&incomplete).await;
            }
            return Err(e);
        }

        tokio::fs::rename(&incomplete, &blob).await?;
        self.handle.set_state(JobState::MovedToBlob);

        self.link(&blob, &pointer, true).await?;
        self.handle.set_state(JobState::Linked);
        lock.release();

        layout.write_ref(repo, revision, &commit_hash)?;
        crate::metrics::record_file_downloaded(&repo.id);
        Ok(pointer)
    }

    /// Answer from the cache alone
    fn local_lookup(&self, revision: &str) -> HubResult<PathBuf> {
        let request = &self.request;
        match self
            .downloader
            .layout
            .lookup(&request.repo, revision, &request.filename)?
        {
            CachedLookup::Found(pointer) => {
                self.handle.progress().mark_complete();
                Ok(pointer)
            }
            CachedLookup::KnownMissing { commit_hash } => {
                Err(self.entry_not_found(Some(commit_hash)))
            }
            CachedLookup::NotCached => Err(HubError::LocalEntryNotFound(format!(
                "{} of {} at revision {} is not cached and network access is disabled",
                request.filename, request.repo.id, revision
            ))),
        }
    }

    async fn resolve_metadata(&self, revision: &str) -> HubResult<FileMetadata> {
        let api = &self.downloader.api;
        let repo = &self.request.repo;
        let filename = self.request.filename.as_str();
        let cancel = self.handle.token();

        retry_transient(
            &repo.id,
            self.downloader.options.retry_interval,
            cancel,
            move || cancellable(cancel, api.resolve_file_metadata(repo, filename, revision)),
        )
        .await
    }

    async fn transfer(&self, url: &str, incomplete: &Path, expected: u64) -> HubResult<()> {
        retry_transient(
            &self.request.repo.id,
            self.downloader.options.retry_interval,
            self.handle.token(),
            move || self.transfer_once(url, incomplete, expected),
        )
        .await
    }

    /// One transfer attempt, resuming from whatever the partial file holds
    async fn transfer_once(&self, url: &str, incomplete: &Path, expected: u64) -> HubResult<()> {
        let cancel = self.handle.token();
        let progress = self.handle.progress();

        let mut offset = match tokio::fs::metadata(incomplete).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if offset > expected {
            tracing::warn!(path = ?incomplete, offset, expected, "Partial file larger than blob, restarting");
            remove_partial(incomplete).await?;
            offset = 0;
        }

        let mut headers = self.downloader.api.headers();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if offset > 0 {
            let range = HeaderValue::from_str(&format!("bytes={}-", offset))
                .map_err(|e| HubError::Transport(e.to_string()))?;
            headers.insert(RANGE, range);
        }

        let transport = self.downloader.api.transport();
        let (response, mut body) = cancellable(cancel, transport.get(url, headers)).await?;

        let mut file = match response.status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                tracing::debug!(path = ?incomplete, offset, "Resuming transfer");
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(incomplete)
                    .await?
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset == expected => {
                progress.set_completed(offset);
                return Ok(());
            }
            status if status.is_success() => {
                if offset > 0 {
                    tracing::debug!(path = ?incomplete, "Range ignored by server, restarting");
                }
                offset = 0;
                tokio::fs::File::create(incomplete).await?
            }
            status => {
                return Err(HubError::from_response(
                    status,
                    &response.headers,
                    &ErrorContext {
                        repo_id: self.request.repo.id.clone(),
                        revision: self.request.revision().to_string(),
                        filename: Some(self.request.filename.clone()),
                        url: url.to_string(),
                    },
                ));
            }
        };
        progress.set_completed(offset);

        let started_at = offset;
        let outcome = loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(HubError::Cancelled),
                chunk = body.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            let received = offset + chunk.len() as u64;
            if received > expected {
                break Err(HubError::SizeMismatch {
                    path: incomplete.to_path_buf(),
                    expected,
                    actual: received,
                });
            }

            if let Err(e) = file.write_all(&chunk).await {
                break Err(e.into());
            }
            offset = received;
            progress.advance(chunk.len() as u64);
        };

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        crate::metrics::record_bytes_downloaded(&self.request.repo.id, offset - started_at);

        match outcome {
            Err(e @ HubError::SizeMismatch { .. }) => {
                remove_partial(incomplete).await?;
                Err(e)
            }
            Err(e) => Err(e),
            Ok(()) if offset < expected => Err(HubError::Transport(format!(
                "connection closed after {} of {} bytes",
                offset, expected
            ))),
            Ok(()) => Ok(()),
        }
    }

    async fn link(&self, blob: &Path, pointer: &Path, new_blob: bool) -> HubResult<()> {
        let root = self.downloader.layout.root();
        self.downloader
            .linker
            .create_pointer(root, blob, pointer, new_blob)
            .await
    }

    /// Keep the partial file after a pause, delete it after a cancel
    async fn stop_partial(&self, incomplete: &Path) {
        if self.handle.discarding() {
            if let Err(e) = remove_partial(incomplete).await {
                tracing::warn!(path = ?incomplete, error = %e, "Failed to discard partial file");
            }
            return;
        }

        let offset = tokio::fs::metadata(incomplete)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        self.handle.set_resume_token(ResumeToken {
            incomplete_path: incomplete.to_path_buf(),
            offset,
        });
    }

    fn entry_not_found(&self, commit_hash: Option<String>) -> HubError {
        HubError::EntryNotFound {
            repo_id: self.request.repo.id.clone(),
            filename: self.request.filename.clone(),
            revision: self.request.revision().to_string(),
            commit_hash,
        }
    }

    fn not_reproducible(&self, missing: &str) -> HubError {
        HubError::NotReproducible(format!(
            "server did not return a {} for {} in {}",
            missing, self.request.filename, self.request.repo.id
        ))
    }
}

async fn remove_partial(path: &Path) -> HubResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Nearest existing ancestor of each path, one per volume
fn volumes_to_check(paths: &[&Path]) -> Vec<PathBuf> {
    let mut seen = Vec::new();
    let mut volumes = Vec::new();
    for path in paths {
        let Some(existing) = path.ancestors().find(|p| p.exists()) else {
            continue;
        };
        let id = volume_id(existing);
        if !seen.contains(&id) {
            seen.push(id);
            volumes.push(existing.to_path_buf());
        }
    }
    volumes
}

#[cfg(unix)]
fn volume_id(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.dev())
}

#[cfg(not(unix))]
fn volume_id(path: &Path) -> Option<PathBuf> {
    path.ancestors().last().map(Path::to_path_buf)
}

fn warn_if_low_space(paths: &[&Path], needed: u64) {
    for volume in volumes_to_check(paths) {
        match fs2::available_space(&volume) {
            Ok(available) if available < needed => {
                tracing::warn!(
                    path = ?volume,
                    available,
                    needed,
                    "Not enough free disk space for download"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(path = ?volume, error = %e, "Could not check free space"),
        }
    }
}
