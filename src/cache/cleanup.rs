//! Revision deletion and keep-latest cleanup
//!
//! Deletion is planned first ([`DeleteStrategy`]) and executed second, so the
//! freed size is known before anything is removed and a plan can be shown as
//! a dry run. Blobs still referenced by a surviving revision are never planned.

use super::layout::{NO_EXIST_DIR, REFS_DIR};
use super::scan::{CacheInfo, CacheManager, CachedRepoInfo};
use crate::error::HubResult;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Paths to delete and the bytes that deletion frees
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteStrategy {
    pub expected_freed_size: u64,
    pub blobs: BTreeSet<PathBuf>,
    pub refs: BTreeSet<PathBuf>,
    pub repos: BTreeSet<PathBuf>,
    pub snapshots: BTreeSet<PathBuf>,
    pub no_exist: BTreeSet<PathBuf>,
}

impl DeleteStrategy {
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
            && self.refs.is_empty()
            && self.repos.is_empty()
            && self.snapshots.is_empty()
            && self.no_exist.is_empty()
    }

    /// Delete everything in the plan, returning the planned freed size
    ///
    /// Paths that are already gone are skipped.
    pub fn execute(&self) -> HubResult<u64> {
        for repo in &self.repos {
            remove_dir(repo)?;
        }
        for snapshot in &self.snapshots {
            remove_dir(snapshot)?;
        }
        for no_exist in &self.no_exist {
            remove_dir(no_exist)?;
        }
        for reference in &self.refs {
            remove_file(reference)?;
        }
        for blob in &self.blobs {
            remove_file(blob)?;
        }

        tracing::info!(
            freed_bytes = self.expected_freed_size,
            repos = self.repos.len(),
            snapshots = self.snapshots.len(),
            blobs = self.blobs.len(),
            "Cache entries deleted"
        );
        crate::metrics::record_bytes_freed(self.expected_freed_size);
        Ok(self.expected_freed_size)
    }
}

/// A repository whose cleanup failed
#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub repo_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub freed_bytes: u64,
    pub repos_cleaned: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CacheInfo {
    /// Plan the deletion of the given commits across all repositories
    ///
    /// A repository losing every revision is deleted whole.
    pub fn delete_revisions(&self, commit_hashes: &[&str]) -> DeleteStrategy {
        let wanted: HashSet<&str> = commit_hashes.iter().copied().collect();
        let mut found = HashSet::new();
        let mut strategy = DeleteStrategy::default();

        for repo in &self.repos {
            let doomed: HashSet<&str> = repo
                .revisions
                .iter()
                .map(|rev| rev.commit_hash.as_str())
                .filter(|commit| wanted.contains(commit))
                .collect();
            found.extend(doomed.iter().copied());
            plan_repo(repo, &doomed, &mut strategy);
        }

        for commit in wanted.difference(&found) {
            tracing::warn!(commit = %commit, "Revision not found in cache, nothing to delete");
        }
        strategy
    }
}

/// Add the deletion of `doomed` revisions of `repo` to `strategy`
fn plan_repo(repo: &CachedRepoInfo, doomed: &HashSet<&str>, strategy: &mut DeleteStrategy) {
    if doomed.is_empty() {
        return;
    }

    if repo
        .revisions
        .iter()
        .all(|rev| doomed.contains(rev.commit_hash.as_str()))
    {
        strategy.repos.insert(repo.repo_path.clone());
        strategy.expected_freed_size += repo.size_on_disk;
        return;
    }

    let kept_blobs: HashSet<&Path> = repo
        .revisions
        .iter()
        .filter(|rev| !doomed.contains(rev.commit_hash.as_str()))
        .flat_map(|rev| rev.blob_paths())
        .collect();

    for revision in repo
        .revisions
        .iter()
        .filter(|rev| doomed.contains(rev.commit_hash.as_str()))
    {
        strategy.snapshots.insert(revision.snapshot_path.clone());
        strategy
            .no_exist
            .insert(repo.repo_path.join(NO_EXIST_DIR).join(&revision.commit_hash));
        for ref_name in &revision.refs {
            strategy
                .refs
                .insert(repo.repo_path.join(REFS_DIR).join(ref_name));
        }

        for file in &revision.files {
            if kept_blobs.contains(file.blob_path.as_path()) {
                continue;
            }
            if strategy.blobs.insert(file.blob_path.clone()) {
                strategy.expected_freed_size += file.size_on_disk;
            }
        }
    }
}

impl CacheManager {
    /// Plan keeping only the most recently modified revision of `repo`
    pub fn plan_keep_latest(&self, repo: &CachedRepoInfo) -> DeleteStrategy {
        let mut strategy = DeleteStrategy::default();
        let Some(latest) = repo.latest_revision() else {
            return strategy;
        };

        let doomed: HashSet<&str> = repo
            .revisions
            .iter()
            .map(|rev| rev.commit_hash.as_str())
            .filter(|commit| *commit != latest.commit_hash)
            .collect();
        plan_repo(repo, &doomed, &mut strategy);
        strategy
    }

    /// Delete every revision of `repo` except the latest, returning bytes freed
    pub fn cleanup_repo_keep_latest(&self, repo: &CachedRepoInfo) -> HubResult<u64> {
        let Some(latest) = repo.latest_revision() else {
            return Ok(0);
        };

        let strategy = self.plan_keep_latest(repo);
        let freed = if strategy.is_empty() {
            0
        } else {
            strategy.execute()?
        };
        prune_refs(&repo.repo_path.join(REFS_DIR), &latest.commit_hash)?;

        tracing::info!(
            repo_id = %repo.repo_id,
            kept = %latest.commit_hash,
            freed_bytes = freed,
            "Repository cleaned"
        );
        Ok(freed)
    }

    /// Keep-latest cleanup over the whole cache
    ///
    /// A failing repository is reported and the others still get cleaned.
    pub fn cleanup_all_keep_latest(&self) -> HubResult<CleanupReport> {
        let info = self.scan_cache()?;
        let mut report = CleanupReport::default();

        for repo in &info.repos {
            match self.cleanup_repo_keep_latest(repo) {
                Ok(freed) => {
                    report.freed_bytes += freed;
                    report.repos_cleaned += 1;
                }
                Err(e) => {
                    tracing::warn!(repo_id = %repo.repo_id, error = %e, "Repository cleanup failed");
                    report.failures.push(CleanupFailure {
                        repo_id: repo.repo_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Dry run of [`Self::cleanup_all_keep_latest`]
    pub fn plan_cleanup_all(&self) -> HubResult<DeleteStrategy> {
        let info = self.scan_cache()?;
        let mut combined = DeleteStrategy::default();
        for repo in &info.repos {
            let plan = self.plan_keep_latest(repo);
            combined.expected_freed_size += plan.expected_freed_size;
            combined.blobs.extend(plan.blobs);
            combined.refs.extend(plan.refs);
            combined.repos.extend(plan.repos);
            combined.snapshots.extend(plan.snapshots);
            combined.no_exist.extend(plan.no_exist);
        }
        Ok(combined)
    }
}

/// Remove refs that do not point at `keep`
fn prune_refs(refs_dir: &Path, keep: &str) -> HubResult<()> {
    if !refs_dir.is_dir() {
        return Ok(());
    }

    let stale: Vec<PathBuf> = WalkDir::new(refs_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            std::fs::read_to_string(entry.path())
                .map(|content| content.trim() != keep)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    for path in stale {
        remove_file(&path)?;
    }
    Ok(())
}

fn remove_dir(path: &Path) -> HubResult<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn remove_file(path: &Path) -> HubResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
