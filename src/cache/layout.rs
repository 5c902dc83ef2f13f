//! On-disk cache layout
//!
//! ```text
//! <cache root>/
//! ├── .locks/
//! │   └── models--org--name/<etag>.lock
//! └── models--org--name/
//!     ├── blobs/<etag>                    content, one file per ETag
//!     ├── refs/main                       "<commit hash>"
//!     ├── snapshots/<commit>/config.json  -> ../../blobs/<etag>
//!     └── .no_exist/<commit>/missing.bin  negative-cache marker
//! ```

use crate::error::{HubError, HubResult};
use crate::repo::{RepoKind, RepoRef, is_commit_hash, validate_repo_id};
use std::path::{Component, Path, PathBuf};

/// Joins the kind and the id segments in a repo folder name
pub const REPO_FOLDER_SEPARATOR: &str = "--";
/// Shared lock directory under the cache root
pub const LOCKS_DIR: &str = ".locks";
pub const BLOBS_DIR: &str = "blobs";
pub const REFS_DIR: &str = "refs";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const NO_EXIST_DIR: &str = ".no_exist";
/// Suffix of a partially transferred blob (the resume token on disk)
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Folder name for a repository, e.g. `models--BAAI--bge-small-en-v1.5`
pub fn repo_folder_name(kind: RepoKind, repo_id: &str) -> String {
    format!(
        "{}{}{}",
        kind.plural(),
        REPO_FOLDER_SEPARATOR,
        repo_id.replace('/', REPO_FOLDER_SEPARATOR)
    )
}

/// Parse a folder name back into `(kind, repo_id)`
pub fn parse_repo_folder(name: &str) -> Option<(RepoKind, String)> {
    let (plural, rest) = name.split_once(REPO_FOLDER_SEPARATOR)?;
    let kind = RepoKind::from_plural(plural)?;
    let repo_id = rest.replace(REPO_FOLDER_SEPARATOR, "/");
    validate_repo_id(&repo_id).ok()?;
    Some((kind, repo_id))
}

/// What the local cache knows about a file at a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLookup {
    /// Pointer exists in the snapshot
    Found(PathBuf),
    /// The hub confirmed the file is absent at this commit
    KnownMissing { commit_hash: String },
    NotCached,
}

/// Path arithmetic and small metadata files of one cache root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo: &RepoRef) -> PathBuf {
        self.root.join(repo_folder_name(repo.kind, &repo.id))
    }

    pub fn blobs_dir(&self, repo: &RepoRef) -> PathBuf {
        self.repo_dir(repo).join(BLOBS_DIR)
    }

    pub fn blob_path(&self, repo: &RepoRef, etag: &str) -> HubResult<PathBuf> {
        safe_join(&self.blobs_dir(repo), single_component(etag)?)
    }

    pub fn incomplete_path(&self, repo: &RepoRef, etag: &str) -> HubResult<PathBuf> {
        let mut path = self.blob_path(repo, etag)?.into_os_string();
        path.push(INCOMPLETE_SUFFIX);
        Ok(PathBuf::from(path))
    }

    pub fn refs_dir(&self, repo: &RepoRef) -> PathBuf {
        self.repo_dir(repo).join(REFS_DIR)
    }

    pub fn ref_path(&self, repo: &RepoRef, revision: &str) -> HubResult<PathBuf> {
        safe_join(&self.refs_dir(repo), revision)
    }

    pub fn snapshots_dir(&self, repo: &RepoRef) -> PathBuf {
        self.repo_dir(repo).join(SNAPSHOTS_DIR)
    }

    pub fn snapshot_dir(&self, repo: &RepoRef, commit_hash: &str) -> HubResult<PathBuf> {
        safe_join(&self.snapshots_dir(repo), single_component(commit_hash)?)
    }

    /// Snapshot entry for `filename`, guaranteed to stay under `snapshots/<commit>/`
    pub fn pointer_path(
        &self,
        repo: &RepoRef,
        commit_hash: &str,
        filename: &str,
    ) -> HubResult<PathBuf> {
        safe_join(&self.snapshot_dir(repo, commit_hash)?, filename)
    }

    pub fn no_exist_path(
        &self,
        repo: &RepoRef,
        commit_hash: &str,
        filename: &str,
    ) -> HubResult<PathBuf> {
        let dir = safe_join(
            &self.repo_dir(repo).join(NO_EXIST_DIR),
            single_component(commit_hash)?,
        )?;
        safe_join(&dir, filename)
    }

    pub fn lock_path(&self, repo: &RepoRef, etag: &str) -> HubResult<PathBuf> {
        let dir = self
            .root
            .join(LOCKS_DIR)
            .join(repo_folder_name(repo.kind, &repo.id));
        safe_join(&dir, &format!("{}.lock", single_component(etag)?))
    }

    /// Commit a ref points to, if recorded
    pub fn read_ref(&self, repo: &RepoRef, revision: &str) -> HubResult<Option<String>> {
        match std::fs::read_to_string(self.ref_path(repo, revision)?) {
            Ok(content) => {
                let commit = content.trim();
                Ok((!commit.is_empty()).then(|| commit.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record `revision -> commit_hash` unless the revision already is the commit
    pub fn write_ref(&self, repo: &RepoRef, revision: &str, commit_hash: &str) -> HubResult<()> {
        if revision == commit_hash {
            return Ok(());
        }
        if self.read_ref(repo, revision)?.as_deref() == Some(commit_hash) {
            return Ok(());
        }

        let path = self.ref_path(repo, revision)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Atomic write: temp file next to the ref, then rename
        let mut temp = path.clone().into_os_string();
        temp.push(format!(".tmp-{}", std::process::id()));
        let temp = PathBuf::from(temp);
        std::fs::write(&temp, commit_hash)?;
        std::fs::rename(&temp, &path)?;

        tracing::debug!(repo_id = %repo.id, revision = %revision, commit = %commit_hash, "Ref updated");
        Ok(())
    }

    /// Map a revision to a commit using only local state
    pub fn resolve_commit(&self, repo: &RepoRef, revision: &str) -> HubResult<Option<String>> {
        if is_commit_hash(revision) {
            return Ok(Some(revision.to_string()));
        }
        self.read_ref(repo, revision)
    }

    /// Write a negative-cache marker for a file confirmed absent at a commit
    pub fn mark_missing(&self, repo: &RepoRef, commit_hash: &str, filename: &str) -> HubResult<()> {
        let path = self.no_exist_path(repo, commit_hash, filename)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&path)?;
        Ok(())
    }

    pub fn is_known_missing(&self, repo: &RepoRef, commit_hash: &str, filename: &str) -> bool {
        self.no_exist_path(repo, commit_hash, filename)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Look a file up without touching the network
    pub fn lookup(&self, repo: &RepoRef, revision: &str, filename: &str) -> HubResult<CachedLookup> {
        let Some(commit_hash) = self.resolve_commit(repo, revision)? else {
            return Ok(CachedLookup::NotCached);
        };

        let pointer = self.pointer_path(repo, &commit_hash, filename)?;
        if pointer.exists() {
            return Ok(CachedLookup::Found(pointer));
        }
        if self.is_known_missing(repo, &commit_hash, filename) {
            return Ok(CachedLookup::KnownMissing { commit_hash });
        }
        Ok(CachedLookup::NotCached)
    }
}

/// Reject repository filenames that could escape a snapshot directory
pub fn validate_filename(filename: &str) -> HubResult<()> {
    safe_join(Path::new(""), filename).map(|_| ())
}

/// Join a relative, `/`-separated path that must not leave `base`
fn safe_join(base: &Path, relative: &str) -> HubResult<PathBuf> {
    let rel = Path::new(relative);
    let escapes = relative.is_empty()
        || rel
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));

    if escapes {
        return Err(HubError::PathEscape {
            path: base.join(rel),
        });
    }
    Ok(base.join(rel))
}

fn single_component(name: &str) -> HubResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(HubError::PathEscape {
            path: PathBuf::from(name),
        });
    }
    Ok(name)
}
