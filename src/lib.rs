//! Hub Cache - model hub download engine
//!
//! Downloads files and whole snapshots from a model hub into a
//! content-addressed local cache shared by concurrent processes, and scans
//! and cleans that cache.

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod hub;
pub mod lock;
pub mod metrics;
pub mod repo;

pub use cache::{CacheInfo, CacheLayout, CacheManager, DeleteStrategy};
pub use config::HubConfig;
pub use download::{
    FileDownloadRequest, FileDownloader, JobHandle, JobState, SnapshotDownloader,
    SnapshotRequest,
};
pub use error::{HubError, HubResult};
pub use hub::{HttpTransport, HubApi, Transport};
pub use lock::FileLock;
pub use repo::{RepoKind, RepoRef};
