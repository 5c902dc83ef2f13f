//! Repository identity shared by the resolver, downloaders and cache manager

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of repository hosted on the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    Model,
    Dataset,
    Space,
}

impl RepoKind {
    pub const ALL: [RepoKind; 3] = [RepoKind::Model, RepoKind::Dataset, RepoKind::Space];

    /// Plural form used both in API paths and cache folder names
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Space => "spaces",
        }
    }

    /// Parse the plural form back into a kind
    pub fn from_plural(plural: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.plural() == plural)
    }

    /// URL prefix for content URLs (models live at the hub root)
    pub(crate) fn url_prefix(&self) -> &'static str {
        match self {
            Self::Model => "",
            Self::Dataset => "datasets/",
            Self::Space => "spaces/",
        }
    }
}

impl std::fmt::Display for RepoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Dataset => write!(f, "dataset"),
            Self::Space => write!(f, "space"),
        }
    }
}

impl FromStr for RepoKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" | "models" => Ok(Self::Model),
            "dataset" | "datasets" => Ok(Self::Dataset),
            "space" | "spaces" => Ok(Self::Space),
            other => Err(HubError::InvalidRepoId(format!(
                "unknown repository type '{}'",
                other
            ))),
        }
    }
}

/// A repository on the hub, e.g. `model:BAAI/bge-small-en-v1.5`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub kind: RepoKind,
    pub id: String,
}

impl RepoRef {
    /// Create a validated repository reference
    pub fn new(kind: RepoKind, id: impl Into<String>) -> HubResult<Self> {
        let id = id.into();
        validate_repo_id(&id)?;
        Ok(Self { kind, id })
    }

    /// Shorthand for a model repository
    pub fn model(id: impl Into<String>) -> HubResult<Self> {
        Self::new(RepoKind::Model, id)
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Check a repo id is usable both as a URL path and as a cache folder name
///
/// Ids are `name` or `namespace/name`. The folder separator `--` and `..` are
/// rejected so that folder names parse back to the same id.
pub fn validate_repo_id(id: &str) -> HubResult<()> {
    let invalid = |reason: &str| Err(HubError::InvalidRepoId(format!("'{}': {}", id, reason)));

    if id.is_empty() || id.len() > 96 {
        return invalid("length must be between 1 and 96");
    }
    if id.matches('/').count() > 1 {
        return invalid("at most one '/' is allowed");
    }
    if id.contains("--") || id.contains("..") {
        return invalid("'--' and '..' are forbidden");
    }
    for part in id.split('/') {
        if part.is_empty() {
            return invalid("empty path segment");
        }
        if part.starts_with(['-', '.']) || part.ends_with(['-', '.']) {
            return invalid("segments cannot start or end with '-' or '.'");
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return invalid("only alphanumerics, '-', '_' and '.' are allowed");
        }
    }

    Ok(())
}

/// True if `revision` is a full 40-character commit hash
pub fn is_commit_hash(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}
