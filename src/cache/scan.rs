//! Cache inventory scanning
//!
//! Scans are best-effort and take no locks. A scan running next to a download
//! can observe a half-written tree (a blob still `.incomplete`, a snapshot
//! missing its newest pointer); such entries are simply not reported yet.

use super::layout::{
    CacheLayout, LOCKS_DIR, REFS_DIR, SNAPSHOTS_DIR, parse_repo_folder,
};
use crate::error::{HubError, HubResult};
use crate::repo::{RepoKind, RepoRef};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// OS metadata files that never belong to a snapshot
const IGNORED_FILES: [&str; 3] = [".DS_Store", "Thumbs.db", "desktop.ini"];

/// A snapshot entry and the blob it resolves to
#[derive(Debug, Clone, Serialize)]
pub struct CachedFileInfo {
    /// Path relative to the snapshot root, `/`-separated
    pub file_name: String,
    pub file_path: PathBuf,
    pub blob_path: PathBuf,
    pub size_on_disk: u64,
    pub blob_last_accessed: DateTime<Utc>,
    pub blob_last_modified: DateTime<Utc>,
}

/// One materialized revision
#[derive(Debug, Clone, Serialize)]
pub struct CachedRevisionInfo {
    pub commit_hash: String,
    pub snapshot_path: PathBuf,
    /// Size of the distinct blobs this revision references
    pub size_on_disk: u64,
    pub files: Vec<CachedFileInfo>,
    pub refs: BTreeSet<String>,
    pub last_modified: DateTime<Utc>,
}

impl CachedRevisionInfo {
    pub fn blob_paths(&self) -> HashSet<&Path> {
        self.files.iter().map(|f| f.blob_path.as_path()).collect()
    }
}

/// One repository folder
#[derive(Debug, Clone, Serialize)]
pub struct CachedRepoInfo {
    pub repo_id: String,
    pub repo_kind: RepoKind,
    pub repo_path: PathBuf,
    /// Size of the distinct blobs across all revisions
    pub size_on_disk: u64,
    /// Number of distinct blobs
    pub nb_files: usize,
    pub revisions: Vec<CachedRevisionInfo>,
    pub last_accessed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl CachedRepoInfo {
    pub fn repo(&self) -> RepoRef {
        RepoRef {
            kind: self.repo_kind,
            id: self.repo_id.clone(),
        }
    }

    /// Revision with the greatest last-modified time
    pub fn latest_revision(&self) -> Option<&CachedRevisionInfo> {
        self.revisions.iter().max_by_key(|rev| rev.last_modified)
    }

    pub fn revision(&self, commit_hash: &str) -> Option<&CachedRevisionInfo> {
        self.revisions.iter().find(|rev| rev.commit_hash == commit_hash)
    }
}

/// A corruption finding. The repository it concerns is left out of the inventory.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheCorruption {
    #[error("{path:?} is not a valid repository folder name")]
    UnparseableFolder { path: PathBuf },

    #[error("repository {path:?} has no snapshots directory")]
    MissingSnapshots { path: PathBuf },

    #[error("snapshot entry {path:?} points to a missing blob")]
    BrokenLink { path: PathBuf },

    #[error("ref '{ref_name}' in {repo_path:?} refers to missing commit {commit_hash}")]
    MissingRefTarget {
        repo_path: PathBuf,
        ref_name: String,
        commit_hash: String,
    },

    #[error("cannot read {path:?}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// Scan result
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_dir: PathBuf,
    pub size_on_disk: u64,
    pub repos: Vec<CachedRepoInfo>,
    pub warnings: Vec<CacheCorruption>,
}

impl CacheInfo {
    pub fn repo(&self, kind: RepoKind, repo_id: &str) -> Option<&CachedRepoInfo> {
        self.repos
            .iter()
            .find(|repo| repo.repo_kind == kind && repo.repo_id == repo_id)
    }
}

/// Scans and cleans a cache root
#[derive(Debug, Clone)]
pub struct CacheManager {
    layout: CacheLayout,
}

impl CacheManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: CacheLayout::new(cache_dir),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Build the inventory of every repository under the cache root
    pub fn scan_cache(&self) -> HubResult<CacheInfo> {
        let root = self.layout.root();
        if !root.is_dir() {
            return Err(HubError::CacheNotFound(root.to_path_buf()));
        }

        let mut repos = Vec::new();
        let mut warnings = Vec::new();

        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_name() == LOCKS_DIR || !path.is_dir() {
                continue;
            }

            match scan_repo(&path) {
                Ok(repo) => repos.push(repo),
                Err(corruption) => {
                    tracing::warn!(path = ?path, error = %corruption, "Corrupted cache entry");
                    warnings.push(corruption);
                }
            }
        }

        repos.sort_by(|a, b| {
            (a.repo_kind, &a.repo_id).cmp(&(b.repo_kind, &b.repo_id))
        });
        let size_on_disk = repos.iter().map(|repo| repo.size_on_disk).sum();

        tracing::debug!(
            cache_dir = ?root,
            repos = repos.len(),
            warnings = warnings.len(),
            size_on_disk,
            "Cache scanned"
        );

        Ok(CacheInfo {
            cache_dir: root.to_path_buf(),
            size_on_disk,
            repos,
            warnings,
        })
    }
}

fn scan_repo(repo_path: &Path) -> Result<CachedRepoInfo, CacheCorruption> {
    let folder = repo_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let Some((repo_kind, repo_id)) = parse_repo_folder(folder) else {
        return Err(CacheCorruption::UnparseableFolder {
            path: repo_path.to_path_buf(),
        });
    };

    let snapshots_dir = repo_path.join(SNAPSHOTS_DIR);
    if !snapshots_dir.is_dir() {
        return Err(CacheCorruption::MissingSnapshots {
            path: repo_path.to_path_buf(),
        });
    }

    let mut refs_by_hash = read_refs(&repo_path.join(REFS_DIR))?;
    let mut blob_stats: HashMap<PathBuf, Metadata> = HashMap::new();
    let mut revisions = Vec::new();

    for entry in std::fs::read_dir(&snapshots_dir).map_err(|e| unreadable(&snapshots_dir, e))? {
        let entry = entry.map_err(|e| unreadable(&snapshots_dir, e))?;
        let revision_path = entry.path();
        let commit_hash = entry.file_name().to_string_lossy().to_string();

        if IGNORED_FILES.contains(&commit_hash.as_str()) {
            continue;
        }
        if !revision_path.is_dir() {
            tracing::debug!(path = ?revision_path, "Skipping non-directory in snapshots");
            continue;
        }

        let files = scan_revision_files(&revision_path, &mut blob_stats)?;

        let mut seen = HashSet::new();
        let size_on_disk = files
            .iter()
            .filter(|f| seen.insert(f.blob_path.clone()))
            .map(|f| f.size_on_disk)
            .sum();

        let last_modified = match files.iter().map(|f| f.blob_last_modified).max() {
            Some(latest) => latest,
            None => modified_time(&revision_path)?,
        };

        revisions.push(CachedRevisionInfo {
            refs: refs_by_hash.remove(&commit_hash).unwrap_or_default(),
            commit_hash,
            snapshot_path: revision_path,
            size_on_disk,
            files,
            last_modified,
        });
    }

    if let Some((commit_hash, ref_names)) = refs_by_hash.into_iter().next() {
        return Err(CacheCorruption::MissingRefTarget {
            repo_path: repo_path.to_path_buf(),
            ref_name: ref_names.into_iter().next().unwrap_or_default(),
            commit_hash,
        });
    }

    revisions.sort_by(|a, b| a.commit_hash.cmp(&b.commit_hash));

    let (last_accessed, last_modified) = if blob_stats.is_empty() {
        let modified = modified_time(repo_path)?;
        (modified, modified)
    } else {
        (
            blob_stats.values().map(accessed).max().unwrap_or_default(),
            blob_stats.values().map(modified).max().unwrap_or_default(),
        )
    };

    Ok(CachedRepoInfo {
        repo_id,
        repo_kind,
        repo_path: repo_path.to_path_buf(),
        size_on_disk: blob_stats.values().map(Metadata::len).sum(),
        nb_files: blob_stats.len(),
        revisions,
        last_accessed,
        last_modified,
    })
}

/// Reverse map `commit -> ref names` from a `refs/` tree
fn read_refs(refs_dir: &Path) -> Result<BTreeMap<String, BTreeSet<String>>, CacheCorruption> {
    let mut refs_by_hash: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    if !refs_dir.is_dir() {
        return Ok(refs_by_hash);
    }

    for entry in WalkDir::new(refs_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CacheCorruption::Unreadable {
            path: refs_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let ref_name = relative_name(refs_dir, entry.path());
        let commit = std::fs::read_to_string(entry.path())
            .map_err(|e| unreadable(entry.path(), e))?
            .trim()
            .to_string();

        refs_by_hash.entry(commit).or_default().insert(ref_name);
    }

    Ok(refs_by_hash)
}

fn scan_revision_files(
    revision_path: &Path,
    blob_stats: &mut HashMap<PathBuf, Metadata>,
) -> Result<Vec<CachedFileInfo>, CacheCorruption> {
    let mut files = Vec::new();

    for entry in WalkDir::new(revision_path)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| CacheCorruption::Unreadable {
            path: revision_path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if IGNORED_FILES.contains(&name.as_ref()) {
            continue;
        }

        let file_path = entry.path().to_path_buf();
        let broken = || CacheCorruption::BrokenLink {
            path: file_path.clone(),
        };

        let blob_path = std::fs::canonicalize(&file_path).map_err(|_| broken())?;
        let stat = match blob_stats.get(&blob_path) {
            Some(stat) => stat.clone(),
            None => {
                let stat = std::fs::metadata(&blob_path).map_err(|_| broken())?;
                blob_stats.insert(blob_path.clone(), stat.clone());
                stat
            }
        };

        files.push(CachedFileInfo {
            file_name: relative_name(revision_path, &file_path),
            file_path,
            blob_path,
            size_on_disk: stat.len(),
            blob_last_accessed: accessed(&stat),
            blob_last_modified: modified(&stat),
        });
    }

    Ok(files)
}

fn relative_name(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn modified(stat: &Metadata) -> DateTime<Utc> {
    stat.modified().map(DateTime::<Utc>::from).unwrap_or_default()
}

fn accessed(stat: &Metadata) -> DateTime<Utc> {
    stat.accessed()
        .or_else(|_| stat.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default()
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>, CacheCorruption> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .or_else(|e| match e.kind() {
            std::io::ErrorKind::Unsupported => Ok(DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)),
            _ => Err(unreadable(path, e)),
        })
}

fn unreadable(path: &Path, e: std::io::Error) -> CacheCorruption {
    CacheCorruption::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
