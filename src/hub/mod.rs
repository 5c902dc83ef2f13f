//! Hub access
//!
//! Provides functionality for:
//! - The injected HTTP transport capability
//! - Resolving revisions to commits and file listings
//! - Probing per-file transfer metadata (ETag, size, canonical URL)
//! - Searching models

pub mod api;
pub mod transport;
pub mod user_agent;

pub use api::{
    ApiOptions, DEFAULT_REVISION, FileMetadata, HubApi, ModelQuery, ModelSummary, RepoFile,
    RepoInfo, RepoResolution, next_page_link, normalize_etag,
};
pub use transport::{ByteStream, HttpTransport, HubResponse, Transport, TransportOptions};
pub use user_agent::{build_user_agent, dedupe_user_agent};

/// Commit the server resolved the request against
pub const HEADER_REPO_COMMIT: &str = "x-repo-commit";
/// ETag of the linked (LFS) content, preferred over `ETag`
pub const HEADER_LINKED_ETAG: &str = "x-linked-etag";
/// Size of the linked (LFS) content, preferred over `Content-Length`
pub const HEADER_LINKED_SIZE: &str = "x-linked-size";
