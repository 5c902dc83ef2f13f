//! Whole-repository downloads
//!
//! A snapshot job resolves the revision to a commit once, filters the file
//! listing, and runs one file job per selected file pinned to that commit.
//! At most `max_workers` file jobs run at a time. The first real failure
//! cancels the rest of the group and is reported with the failing filename.

use super::file::{FileDownloadRequest, FileDownloader};
use super::filter::filter_repo_objects;
use super::job::JobHandle;
use super::progress::Progress;
use super::{JobState, cancellable, retry_transient};
use crate::error::{HubError, HubResult};
use crate::hub::{DEFAULT_REVISION, RepoFile};
use crate::repo::RepoRef;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub max_workers: usize,
    /// Hand each file to the accelerated transfer path. Files then run one
    /// at a time since that path parallelizes internally.
    pub accelerated_transfer: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            max_workers: 8,
            accelerated_transfer: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub repo: RepoRef,
    pub revision: Option<String>,
    pub allow_patterns: Option<Vec<String>>,
    pub ignore_patterns: Option<Vec<String>>,
    pub force_download: bool,
    pub local_files_only: bool,
}

impl SnapshotRequest {
    pub fn new(repo: RepoRef) -> Self {
        Self {
            repo,
            revision: None,
            allow_patterns: None,
            ignore_patterns: None,
            force_download: false,
            local_files_only: false,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    fn key(&self) -> String {
        format!(
            "{}@{}",
            self.repo,
            self.revision.as_deref().unwrap_or(DEFAULT_REVISION)
        )
    }
}

#[derive(Clone)]
pub struct SnapshotDownloader {
    files: FileDownloader,
    options: SnapshotOptions,
    /// Running jobs by job id; several jobs may share a repo@revision key
    active: Arc<DashMap<u64, (String, JobHandle)>>,
    next_id: Arc<AtomicU64>,
}

impl SnapshotDownloader {
    pub fn new(files: FileDownloader, options: SnapshotOptions) -> Self {
        Self {
            files,
            options,
            active: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn files(&self) -> &FileDownloader {
        &self.files
    }

    pub fn job(&self, request: SnapshotRequest) -> SnapshotJob {
        SnapshotJob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            downloader: self.clone(),
            request,
            handle: JobHandle::new(Progress::root(0)),
        }
    }

    /// Download a snapshot and return its directory
    pub async fn download(&self, request: SnapshotRequest) -> HubResult<PathBuf> {
        self.job(request).run().await
    }

    /// Keys (`kind:repo@revision`) of the snapshots currently running
    pub fn active_jobs(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    /// Pause every running snapshot, keeping partial files
    pub fn pause_all(&self) {
        for entry in self.active.iter() {
            let (key, handle) = entry.value();
            tracing::info!(job = %key, "Pausing snapshot download");
            handle.pause();
        }
    }
}

pub struct SnapshotJob {
    id: u64,
    downloader: SnapshotDownloader,
    request: SnapshotRequest,
    handle: JobHandle,
}

impl SnapshotJob {
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> HubResult<PathBuf> {
        let key = self.request.key();
        self.downloader
            .active
            .insert(self.id, (key.clone(), self.handle.clone()));

        let result = self.execute().await;

        self.downloader.active.remove(&self.id);
        self.handle.finish(&result);

        match &result {
            Ok(path) => tracing::info!(job = %key, path = ?path, "Snapshot ready"),
            Err(e) if e.is_cancelled() => {
                tracing::info!(job = %key, state = ?self.handle.state(), "Snapshot download stopped");
            }
            Err(e) => tracing::warn!(job = %key, error = %e, "Snapshot download failed"),
        }
        result
    }

    async fn execute(&self) -> HubResult<PathBuf> {
        let request = &self.request;
        let repo = &request.repo;
        let revision = request.revision.as_deref().unwrap_or(DEFAULT_REVISION);
        let files = &self.downloader.files;
        let layout = files.layout();

        if request.local_files_only {
            return self.local_snapshot(revision);
        }

        self.handle.set_state(JobState::ResolvingMetadata);
        let cancel = self.handle.token();
        let api = files.api();
        let resolution = retry_transient(
            &repo.id,
            files.options().retry_interval,
            cancel,
            move || cancellable(cancel, api.resolve_repo(repo, Some(revision))),
        )
        .await?;

        let commit_hash = resolution.commit_hash;

        let selected = filter_repo_objects(
            resolution.files,
            request.allow_patterns.as_deref(),
            request.ignore_patterns.as_deref(),
            |file| file.path.as_str(),
        )?;

        let snapshot_dir = layout.snapshot_dir(repo, &commit_hash)?;
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        layout.write_ref(repo, revision, &commit_hash)?;

        tracing::info!(
            repo_id = %repo.id,
            commit = %commit_hash,
            files = selected.len(),
            "Downloading snapshot"
        );
        self.handle.set_state(JobState::Transferring);

        if self.downloader.options.accelerated_transfer {
            self.run_sequential(selected, &commit_hash).await?;
        } else {
            self.run_concurrent(selected, &commit_hash).await?;
        }

        if cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        Ok(snapshot_dir)
    }

    async fn run_sequential(&self, selected: Vec<RepoFile>, commit_hash: &str) -> HubResult<()> {
        let group = self.handle.token().child_token();
        for file in selected {
            let filename = file.path.clone();
            self.file_job(&file, commit_hash, &group)
                .run()
                .await
                .map_err(|e| self.wrap(filename, e))?;
        }
        Ok(())
    }

    async fn run_concurrent(&self, selected: Vec<RepoFile>, commit_hash: &str) -> HubResult<()> {
        let group = self.handle.token().child_token();
        let semaphore = Arc::new(Semaphore::new(self.downloader.options.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for file in selected {
            let permit = tokio::select! {
                biased;
                _ = group.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // A failing sibling cancels the group before releasing its permit
            if group.is_cancelled() {
                break;
            }

            let job = self.file_job(&file, commit_hash, &group);
            let group = group.clone();
            let filename = file.path.clone();
            tasks.spawn(async move {
                let result = job.run().await;
                if let Err(e) = &result
                    && !e.is_cancelled()
                {
                    group.cancel();
                }
                drop(permit);
                (filename, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(_))) => continue,
                Ok((filename, Err(e))) => {
                    if e.is_cancelled() {
                        continue;
                    }
                    self.wrap(filename, e)
                }
                Err(join_error) => HubError::Io(std::io::Error::other(join_error.to_string())),
            };
            group.cancel();
            if first_error.is_none() {
                first_error = Some(failure);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn file_job(
        &self,
        file: &RepoFile,
        commit_hash: &str,
        group: &CancellationToken,
    ) -> super::FileJob {
        let request = FileDownloadRequest {
            repo: self.request.repo.clone(),
            filename: file.path.clone(),
            revision: Some(commit_hash.to_string()),
            force_download: self.request.force_download,
            local_files_only: false,
        };
        let progress = self.handle.progress().child(file.size.unwrap_or(0));
        let handle = self.handle.nested(group.child_token(), progress);
        self.downloader.files.nested_job(request, handle)
    }

    fn wrap(&self, filename: String, source: HubError) -> HubError {
        if source.is_cancelled() {
            return source;
        }
        HubError::FileJob {
            repo_id: self.request.repo.id.clone(),
            filename,
            source: Box::new(source),
        }
    }

    fn local_snapshot(&self, revision: &str) -> HubResult<PathBuf> {
        let repo = &self.request.repo;
        let layout = self.downloader.files.layout();

        let snapshot_dir = match layout.resolve_commit(repo, revision)? {
            Some(commit_hash) => layout.snapshot_dir(repo, &commit_hash)?,
            None => {
                return Err(HubError::LocalEntryNotFound(format!(
                    "no cached revision {} of {} and network access is disabled",
                    revision, repo.id
                )));
            }
        };

        if !snapshot_dir.is_dir() {
            return Err(HubError::LocalEntryNotFound(format!(
                "snapshot {:?} of {} is not cached and network access is disabled",
                snapshot_dir, repo.id
            )));
        }
        self.handle.progress().mark_complete();
        Ok(snapshot_dir)
    }
}
