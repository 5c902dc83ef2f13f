//! Content-addressed local cache
//!
//! Provides functionality for:
//! - Path layout of blobs, refs, snapshots and negative-cache markers
//! - Pointer creation (relative symlink, or copy where symlinks are refused)
//! - Inventory scanning with corruption reporting
//! - Revision deletion and keep-latest cleanup

pub mod cleanup;
pub mod layout;
pub mod link;
pub mod scan;

pub use cleanup::{CleanupFailure, CleanupReport, DeleteStrategy};
pub use layout::{
    CacheLayout, CachedLookup, parse_repo_folder, repo_folder_name, validate_filename,
};
pub use link::{LinkStrategy, Linker};
pub use scan::{
    CacheCorruption, CacheInfo, CacheManager, CachedFileInfo, CachedRepoInfo, CachedRevisionInfo,
};
