//! Snapshot pointers into the blob store
//!
//! Pointers are relative symlinks (`../../blobs/<etag>`) so a cache root can be
//! moved as a whole. Where the filesystem refuses symlinks, the blob is copied,
//! or moved when it was just downloaded. The choice is probed once per cache
//! root and remembered.

use crate::error::HubResult;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    Symlink,
    Copy,
}

/// Creates pointers, caching the link strategy per cache root
#[derive(Debug, Default)]
pub struct Linker {
    strategies: DashMap<PathBuf, LinkStrategy>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the strategy for a root instead of probing it
    pub fn set_strategy(&self, root: &Path, strategy: LinkStrategy) {
        self.strategies.insert(root.to_path_buf(), strategy);
    }

    pub async fn strategy_for(&self, root: &Path) -> LinkStrategy {
        let cached = self.strategies.get(root).map(|entry| *entry.value());
        if let Some(strategy) = cached {
            return strategy;
        }

        let strategy = probe_symlinks(root).await;
        tracing::debug!(root = ?root, strategy = ?strategy, "Link strategy selected");
        self.strategies.insert(root.to_path_buf(), strategy);
        strategy
    }

    /// (Re)create `pointer` so it resolves to `blob`
    ///
    /// `new_blob` allows the copy fallback to move the blob instead of copying.
    pub async fn create_pointer(
        &self,
        root: &Path,
        blob: &Path,
        pointer: &Path,
        new_blob: bool,
    ) -> HubResult<()> {
        let strategy = self.strategy_for(root).await;

        if tokio::fs::symlink_metadata(pointer).await.is_ok() {
            tokio::fs::remove_file(pointer).await?;
        }
        if let Some(parent) = pointer.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if strategy == LinkStrategy::Symlink {
            let target = relative_target(blob, pointer);
            match symlink(&target, pointer).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(pointer = ?pointer, error = %e, "Symlink failed, copying instead");
                }
            }
        }

        if new_blob {
            tokio::fs::rename(blob, pointer).await?;
        } else {
            tokio::fs::copy(blob, pointer).await?;
        }
        Ok(())
    }
}

/// Path of `blob` relative to the directory containing `pointer`
pub fn relative_target(blob: &Path, pointer: &Path) -> PathBuf {
    let from: Vec<_> = pointer
        .parent()
        .map(|p| p.components().collect())
        .unwrap_or_default();
    let to: Vec<_> = blob.components().collect();

    let common = from
        .iter()
        .zip(&to)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..from.len() {
        relative.push("..");
    }
    for component in &to[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

async fn probe_symlinks(root: &Path) -> LinkStrategy {
    if tokio::fs::create_dir_all(root).await.is_err() {
        return LinkStrategy::Copy;
    }

    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let source = root.join(format!(".link-probe-{}-{}", std::process::id(), nonce));
    let link = root.join(format!(".link-probe-{}-{}-link", std::process::id(), nonce));

    if tokio::fs::write(&source, b"").await.is_err() {
        return LinkStrategy::Copy;
    }
    let strategy = match symlink(Path::new(source.file_name().unwrap_or_default()), &link).await {
        Ok(()) => LinkStrategy::Symlink,
        Err(_) => LinkStrategy::Copy,
    };

    let _ = tokio::fs::remove_file(&link).await;
    let _ = tokio::fs::remove_file(&source).await;
    strategy
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

#[cfg(not(any(unix, windows)))]
async fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}
