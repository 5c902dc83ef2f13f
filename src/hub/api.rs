//! Metadata resolution against the hub API
//!
//! Resolves a repository revision to a commit and file listing, probes
//! per-file transfer metadata with header-only requests, and searches models.

use super::transport::{Transport, collect_body};
use super::user_agent::build_user_agent;
use super::{HEADER_LINKED_ETAG, HEADER_LINKED_SIZE, HEADER_REPO_COMMIT};
use crate::error::{ErrorContext, HubError, HubResult, header_str};
use crate::repo::RepoRef;
use chrono::{DateTime, Utc};
use reqwest::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, ETAG, HeaderMap, HeaderValue, LINK, LOCATION,
    USER_AGENT,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Relative redirects (renamed repositories) followed by a metadata probe
const MAX_RELATIVE_REDIRECTS: usize = 5;

/// Revision used when the caller does not name one
pub const DEFAULT_REVISION: &str = "main";

/// Connection settings for the resolver
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub endpoint: String,
    pub token: Option<String>,
    pub user_agent_extra: Option<String>,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            token: None,
            user_agent_extra: None,
        }
    }
}

// ============================================================================
// Response Shapes
// ============================================================================

/// `gated` is either `false` or the gating mode (`"auto"`, `"manual"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatedMode {
    Flag(bool),
    Mode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfsInfo {
    pub sha256: String,
    pub size: u64,
}

/// One file entry of a repository listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSibling {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub blob_id: Option<String>,
    #[serde(default)]
    pub lfs: Option<LfsInfo>,
}

/// Repository metadata as returned by `/api/{kind}/{id}[/revision/{rev}]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<RepoSibling>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub gated: Option<GatedMode>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A file in a resolved listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub path: String,
    pub size: Option<u64>,
    pub content_hash: Option<String>,
}

/// A revision pinned to its commit
#[derive(Debug, Clone)]
pub struct RepoResolution {
    pub commit_hash: String,
    pub files: Vec<RepoFile>,
    pub info: RepoInfo,
}

/// Transfer metadata for one file, read from a HEAD probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub commit_hash: Option<String>,
    /// Normalized ETag, the blob's content address
    pub etag: Option<String>,
    /// Where content should be fetched from
    pub location: String,
    pub size: Option<u64>,
}

/// Search parameters for `GET /api/models`
#[derive(Debug, Clone, Default)]
pub struct ModelQuery {
    pub search: Option<String>,
    pub filter: Vec<String>,
    pub sort: Option<String>,
    /// `-1` for descending
    pub direction: Option<i8>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pipeline_tag: Option<String>,
    #[serde(default, rename = "lastModified")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub private: bool,
}

// ============================================================================
// Resolver
// ============================================================================

/// Hub metadata client
pub struct HubApi {
    transport: Arc<dyn Transport>,
    options: ApiOptions,
    user_agent: String,
}

impl HubApi {
    pub fn new(transport: Arc<dyn Transport>, options: ApiOptions) -> Self {
        let user_agent = build_user_agent(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            options.user_agent_extra.as_deref(),
        );

        Self {
            transport,
            options,
            user_agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.options.endpoint.trim_end_matches('/')
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Authorization and identity headers for a request
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        match HeaderValue::from_str(&self.user_agent) {
            Ok(value) => {
                headers.insert(USER_AGENT, value);
            }
            Err(e) => tracing::warn!(error = %e, "User agent is not a valid header value"),
        }

        if let Some(token) = &self.options.token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("Token is not a valid header value, sending anonymously"),
            }
        }

        headers
    }

    pub fn repo_info_url(&self, repo: &RepoRef, revision: Option<&str>) -> String {
        let mut url = format!("{}/api/{}/{}", self.endpoint(), repo.kind.plural(), repo.id);
        if let Some(revision) = revision {
            url.push_str("/revision/");
            url.push_str(&urlencoding::encode(revision));
        }
        url
    }

    pub fn file_url(&self, repo: &RepoRef, filename: &str, revision: &str) -> String {
        let encoded_name = filename
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        format!(
            "{}/{}{}/resolve/{}/{}",
            self.endpoint(),
            repo.kind.url_prefix(),
            repo.id,
            urlencoding::encode(revision),
            encoded_name
        )
    }

    /// Resolve a revision (default branch when `None`) to a commit and listing
    pub async fn resolve_repo(
        &self,
        repo: &RepoRef,
        revision: Option<&str>,
    ) -> HubResult<RepoResolution> {
        let url = self.repo_info_url(repo, revision);
        tracing::debug!(repo_id = %repo.id, revision = ?revision, "Resolving repository");

        let (response, body) = self.transport.get(&url, self.headers()).await?;
        if !response.status.is_success() {
            return Err(HubError::from_response(
                response.status,
                &response.headers,
                &ErrorContext {
                    repo_id: repo.id.clone(),
                    revision: revision.unwrap_or(DEFAULT_REVISION).to_string(),
                    filename: None,
                    url,
                },
            ));
        }

        let body = collect_body(body).await?;
        let info: RepoInfo = serde_json::from_slice(&body)?;

        let commit_hash = info.sha.clone().ok_or_else(|| {
            HubError::NotReproducible(format!(
                "repository {} did not report a commit hash",
                repo.id
            ))
        })?;

        let files = info
            .siblings
            .iter()
            .map(|sibling| RepoFile {
                path: sibling.rfilename.clone(),
                size: sibling
                    .size
                    .or_else(|| sibling.lfs.as_ref().map(|lfs| lfs.size)),
                content_hash: sibling
                    .lfs
                    .as_ref()
                    .map(|lfs| lfs.sha256.clone())
                    .or_else(|| sibling.blob_id.clone()),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            repo_id = %repo.id,
            commit = %commit_hash,
            files = files.len(),
            "Repository resolved"
        );

        Ok(RepoResolution {
            commit_hash,
            files,
            info,
        })
    }

    /// Probe transfer metadata for one file with a HEAD request
    pub async fn resolve_file_metadata(
        &self,
        repo: &RepoRef,
        filename: &str,
        revision: &str,
    ) -> HubResult<FileMetadata> {
        let mut headers = self.headers();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let mut url = self.file_url(repo, filename, revision);

        for _ in 0..=MAX_RELATIVE_REDIRECTS {
            let response = self.transport.head(&url, headers.clone()).await?;

            if response.status.is_redirection()
                && let Some(location) = header_str(&response.headers, LOCATION.as_str())
            {
                if reqwest::Url::parse(location).is_err() {
                    // Relative: the repository moved, ask again at the new path
                    url = join_url(&url, location)?;
                    tracing::debug!(repo_id = %repo.id, url = %url, "Following relative redirect");
                    continue;
                }
                return Ok(parse_file_metadata(&response.headers, location.to_string()));
            }

            if !response.status.is_success() {
                return Err(HubError::from_response(
                    response.status,
                    &response.headers,
                    &ErrorContext {
                        repo_id: repo.id.clone(),
                        revision: revision.to_string(),
                        filename: Some(filename.to_string()),
                        url,
                    },
                ));
            }

            return Ok(parse_file_metadata(&response.headers, url));
        }

        Err(HubError::NotReproducible(format!(
            "too many redirects resolving {}",
            url
        )))
    }

    /// Search models, following `Link: rel="next"` pagination
    pub async fn list_models(&self, query: &ModelQuery) -> HubResult<Vec<ModelSummary>> {
        let mut next = Some(self.models_search_url(query));
        let mut models = Vec::new();

        while let Some(url) = next.take() {
            let (response, body) = self.transport.get(&url, self.headers()).await?;
            if !response.status.is_success() {
                return Err(HubError::from_response(
                    response.status,
                    &response.headers,
                    &ErrorContext {
                        repo_id: "models".to_string(),
                        revision: DEFAULT_REVISION.to_string(),
                        filename: None,
                        url,
                    },
                ));
            }

            let page: Vec<ModelSummary> = serde_json::from_slice(&collect_body(body).await?)?;
            let page_was_empty = page.is_empty();
            models.extend(page);

            if let Some(limit) = query.limit
                && models.len() >= limit
            {
                models.truncate(limit);
                break;
            }
            if page_was_empty {
                break;
            }
            next = next_page_link(&response.headers);
        }

        Ok(models)
    }

    fn models_search_url(&self, query: &ModelQuery) -> String {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(direction) = query.direction {
            params.push(("direction", direction.to_string()));
        }
        for filter in &query.filter {
            params.push(("filter", filter.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        let mut url = format!("{}/api/models", self.endpoint());
        for (i, (key, value)) in params.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

/// Strip a weak-validator prefix and quotes from a raw ETag
///
/// Idempotent; an empty result is treated as no tag.
pub fn normalize_etag(raw: Option<&str>) -> Option<String> {
    let mut tag = raw?.trim();
    loop {
        let stripped = tag.strip_prefix("W/").unwrap_or(tag).trim_matches('"').trim();
        if stripped == tag {
            break;
        }
        tag = stripped;
    }
    (!tag.is_empty()).then(|| tag.to_string())
}

/// Extract the `rel="next"` target from `Link` headers
pub fn next_page_link(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(LINK) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for link in value.split(',') {
            let mut parts = link.split(';');
            let Some(target) = parts.next() else {
                continue;
            };
            let is_next = parts.any(|param| {
                let param = param.trim().replace(' ', "");
                param == "rel=\"next\"" || param == "rel=next"
            });
            if is_next {
                let target = target.trim().trim_start_matches('<').trim_end_matches('>');
                return Some(target.to_string());
            }
        }
    }
    None
}

fn parse_file_metadata(headers: &HeaderMap, location: String) -> FileMetadata {
    let etag = header_str(headers, HEADER_LINKED_ETAG).or_else(|| header_str(headers, ETAG.as_str()));
    let size = header_str(headers, HEADER_LINKED_SIZE)
        .or_else(|| header_str(headers, CONTENT_LENGTH.as_str()))
        .and_then(|v| v.trim().parse::<u64>().ok());

    FileMetadata {
        commit_hash: header_str(headers, HEADER_REPO_COMMIT).map(str::to_string),
        etag: normalize_etag(etag),
        location,
        size,
    }
}

fn join_url(base: &str, location: &str) -> HubResult<String> {
    reqwest::Url::parse(base)
        .and_then(|base| base.join(location))
        .map(|url| url.to_string())
        .map_err(|e| {
            HubError::NotReproducible(format!("invalid redirect location '{}': {}", location, e))
        })
}
