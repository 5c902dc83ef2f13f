//! Error types for hub requests, downloads and cache maintenance

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::path::PathBuf;
use std::time::Duration;

pub type HubResult<T> = Result<T, HubError>;

/// Header carrying the hub's machine-readable error code
pub const HEADER_ERROR_CODE: &str = "x-error-code";
/// Header carrying the hub's human-readable error message
pub const HEADER_ERROR_MESSAGE: &str = "x-error-message";

const DISABLED_MESSAGE: &str = "Access to this resource is disabled.";

/// Hub and cache error types
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("revision '{revision}' not found in {repo_id}")]
    RevisionNotFound { repo_id: String, revision: String },

    #[error("entry '{filename}' not found in {repo_id}@{revision}")]
    EntryNotFound {
        repo_id: String,
        filename: String,
        revision: String,
        /// Commit the server resolved before reporting the absence
        commit_hash: Option<String>,
    },

    #[error("access to gated repository {0} requires approval")]
    GatedRepo(String),

    #[error("access to {0} has been disabled")]
    ResourceDisabled(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("requested range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("unexpected HTTP status {status} for {url}")]
    Http { status: u16, url: String },

    /// Connection resets, timeouts and server-side hiccups. Retried while the job lives.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request that can never succeed as built: bad URL or scheme, redirect loop, undecodable body
    #[error("request error: {0}")]
    Request(String),

    #[error("timed out after {timeout:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("path {path:?} escapes its cache directory")]
    PathEscape { path: PathBuf },

    #[error("cannot download reproducibly: {0}")]
    NotReproducible(String),

    #[error("size mismatch for {path:?}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("no local copy available: {0}")]
    LocalEntryNotFound(String),

    #[error("cache directory not found: {0:?}")]
    CacheNotFound(PathBuf),

    #[error("invalid repository id {0}")]
    InvalidRepoId(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to download {filename} from {repo_id}: {source}")]
    FileJob {
        repo_id: String,
        filename: String,
        #[source]
        source: Box<HubError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Errors worth retrying after a backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::FileJob { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the error only reflects a cancellation request
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::FileJob { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Build an error from a non-success response
    pub fn from_response(status: StatusCode, headers: &HeaderMap, context: &ErrorContext) -> Self {
        let code = header_str(headers, HEADER_ERROR_CODE);
        let message = header_str(headers, HEADER_ERROR_MESSAGE);
        let repo_id = context.repo_id.clone();

        match code {
            Some("RevisionNotFound") => {
                return Self::RevisionNotFound {
                    repo_id,
                    revision: context.revision.clone(),
                };
            }
            Some("EntryNotFound") => return context.entry_not_found(headers),
            Some("GatedRepo") => return Self::GatedRepo(repo_id),
            Some("RepoNotFound") => return Self::RepoNotFound(repo_id),
            _ => {}
        }

        if message == Some(DISABLED_MESSAGE) {
            return Self::ResourceDisabled(repo_id);
        }

        match status {
            StatusCode::UNAUTHORIZED => Self::RepoNotFound(repo_id),
            StatusCode::FORBIDDEN => Self::Forbidden(message.unwrap_or(&repo_id).to_string()),
            StatusCode::NOT_FOUND => match context.filename {
                Some(_) => context.entry_not_found(headers),
                None => Self::RepoNotFound(repo_id),
            },
            StatusCode::RANGE_NOT_SATISFIABLE => Self::RangeNotSatisfiable(context.url.clone()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Self::Transport(format!("{} from {}", status, context.url))
            }
            s if s.is_server_error() => Self::Transport(format!("{} from {}", s, context.url)),
            s => Self::Http {
                status: s.as_u16(),
                url: context.url.clone(),
            },
        }
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_redirect() || err.is_decode() {
            HubError::Request(err.to_string())
        } else {
            HubError::Transport(err.to_string())
        }
    }
}

/// What a request was about, used to pick the right error variant
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub repo_id: String,
    pub revision: String,
    pub filename: Option<String>,
    pub url: String,
}

impl ErrorContext {
    fn entry_not_found(&self, headers: &HeaderMap) -> HubError {
        HubError::EntryNotFound {
            repo_id: self.repo_id.clone(),
            filename: self.filename.clone().unwrap_or_default(),
            revision: self.revision.clone(),
            commit_hash: header_str(headers, crate::hub::HEADER_REPO_COMMIT).map(str::to_string),
        }
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
