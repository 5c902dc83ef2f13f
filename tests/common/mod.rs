//! In-memory hub shared by the integration tests
//!
//! `MockHub` implements the `Transport` capability. Metadata HEADs answer with
//! a redirect to a CDN URL carrying the hub headers, content GETs honour
//! `Range`, and faults can be injected per filename.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hub_cache::cache::CacheLayout;
use hub_cache::download::{DownloadOptions, FileDownloader, SnapshotDownloader, SnapshotOptions};
use hub_cache::error::{HEADER_ERROR_CODE, HubError, HubResult};
use hub_cache::hub::{
    ApiOptions, ByteStream, HEADER_LINKED_ETAG, HEADER_LINKED_SIZE, HEADER_REPO_COMMIT, HubApi,
    HubResponse, Transport,
};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LINK, LOCATION, RANGE};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ENDPOINT: &str = "https://hub.test";
pub const CDN: &str = "https://cdn.test";
pub const COMMIT: &str = "1111111111111111111111111111111111111111";
pub const COMMIT_2: &str = "2222222222222222222222222222222222222222";

const CHUNK_SIZE: usize = 64;

#[derive(Default)]
struct Faults {
    head_transient: HashMap<String, u32>,
    get_transient: HashMap<String, u32>,
    truncate_once: HashMap<String, usize>,
    stall_after: HashMap<String, usize>,
    pad: HashMap<String, usize>,
    forbidden: HashSet<String>,
}

struct Published {
    repo_id: String,
    commit: String,
    files: BTreeMap<String, Vec<u8>>,
}

pub struct MockHub {
    published: Mutex<Published>,
    /// Old repo id -> current id, answered with a relative redirect
    renamed: Mutex<HashMap<String, String>>,
    search_pages: Mutex<Vec<Vec<serde_json::Value>>>,
    faults: Mutex<Faults>,
    head_calls: Mutex<HashMap<String, usize>>,
    get_calls: Mutex<HashMap<String, usize>>,
    ranges: Mutex<HashMap<String, Vec<Option<String>>>>,
    info_calls: AtomicUsize,
}

/// Content-derived ETag so identical content dedups across commits
pub fn etag_of(content: &[u8]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in content {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}{:08x}", hash, content.len())
}

impl MockHub {
    pub fn new(repo_id: &str, commit: &str) -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Published {
                repo_id: repo_id.to_string(),
                commit: commit.to_string(),
                files: BTreeMap::new(),
            }),
            renamed: Mutex::new(HashMap::new()),
            search_pages: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            head_calls: Mutex::new(HashMap::new()),
            get_calls: Mutex::new(HashMap::new()),
            ranges: Mutex::new(HashMap::new()),
            info_calls: AtomicUsize::new(0),
        })
    }

    pub fn add_file(&self, name: &str, content: impl Into<Vec<u8>>) {
        self.published
            .lock()
            .unwrap()
            .files
            .insert(name.to_string(), content.into());
    }

    /// Replace the head commit and its files
    pub fn publish(&self, commit: &str, files: &[(&str, &[u8])]) {
        let mut published = self.published.lock().unwrap();
        published.commit = commit.to_string();
        published.files = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_vec()))
            .collect();
    }

    pub fn rename_repo(&self, old_id: &str) {
        let current = self.published.lock().unwrap().repo_id.clone();
        self.renamed
            .lock()
            .unwrap()
            .insert(old_id.to_string(), current);
    }

    pub fn set_search_pages(&self, pages: Vec<Vec<serde_json::Value>>) {
        *self.search_pages.lock().unwrap() = pages;
    }

    pub fn fail_head_transiently(&self, name: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .head_transient
            .insert(name.to_string(), times);
    }

    pub fn fail_get_transiently(&self, name: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .get_transient
            .insert(name.to_string(), times);
    }

    /// Next GET of `name` ends cleanly after `bytes`
    pub fn truncate_once(&self, name: &str, bytes: usize) {
        self.faults
            .lock()
            .unwrap()
            .truncate_once
            .insert(name.to_string(), bytes);
    }

    /// GETs of `name` send `bytes` and then hang
    pub fn stall_after(&self, name: &str, bytes: usize) {
        self.faults
            .lock()
            .unwrap()
            .stall_after
            .insert(name.to_string(), bytes);
    }

    /// GETs of `name` append `extra` bytes beyond the advertised size
    pub fn pad_body(&self, name: &str, extra: usize) {
        self.faults.lock().unwrap().pad.insert(name.to_string(), extra);
    }

    pub fn forbid(&self, name: &str) {
        self.faults
            .lock()
            .unwrap()
            .forbidden
            .insert(name.to_string());
    }

    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    pub fn head_count(&self, name: &str) -> usize {
        self.head_calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn get_count(&self, name: &str) -> usize {
        self.get_calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_get_count(&self) -> usize {
        self.get_calls.lock().unwrap().values().sum()
    }

    pub fn info_count(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    /// `Range` header of every content GET of `name`
    pub fn ranges(&self, name: &str) -> Vec<Option<String>> {
        self.ranges
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn take_fault(map: &mut HashMap<String, u32>, name: &str) -> bool {
        match map.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn repo_info(&self, repo_id: &str, revision: &str) -> (HubResponse, ByteStream) {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let published = self.published.lock().unwrap();

        if repo_id != published.repo_id {
            return empty(StatusCode::UNAUTHORIZED, HeaderMap::new(), "info");
        }
        if revision != "main" && revision != published.commit {
            let headers = header_map(&[(HEADER_ERROR_CODE, "RevisionNotFound")]);
            return empty(StatusCode::NOT_FOUND, headers, "info");
        }

        let siblings: Vec<_> = published
            .files
            .iter()
            .map(|(name, content)| {
                serde_json::json!({
                    "rfilename": name,
                    "size": content.len(),
                    "blobId": etag_of(content),
                })
            })
            .collect();
        let body = serde_json::json!({
            "id": published.repo_id,
            "sha": published.commit,
            "siblings": siblings,
        });
        body_response(
            StatusCode::OK,
            HeaderMap::new(),
            "info",
            serde_json::to_vec(&body).unwrap(),
        )
    }

    fn resolve_head(&self, repo_id: &str, revision: &str, name: &str) -> HubResult<HubResponse> {
        *self
            .head_calls
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;

        if Self::take_fault(&mut self.faults.lock().unwrap().head_transient, name) {
            return Err(HubError::Transport("connection reset by peer".into()));
        }

        if let Some(current) = self.renamed.lock().unwrap().get(repo_id) {
            let location = format!("/{}/resolve/{}/{}", current, revision, name);
            let headers = header_map(&[(LOCATION.as_str(), location.as_str())]);
            return Ok(response(StatusCode::TEMPORARY_REDIRECT, headers, "head"));
        }

        let published = self.published.lock().unwrap();
        if repo_id != published.repo_id {
            return Ok(response(StatusCode::UNAUTHORIZED, HeaderMap::new(), "head"));
        }
        let Some(commit) = (revision == "main" || revision == published.commit)
            .then(|| published.commit.clone())
        else {
            let headers = header_map(&[(HEADER_ERROR_CODE, "RevisionNotFound")]);
            return Ok(response(StatusCode::NOT_FOUND, headers, "head"));
        };

        match published.files.get(name) {
            Some(content) => {
                let location = format!("{}/{}/{}", CDN, repo_id, name);
                let etag = format!("\"{}\"", etag_of(content));
                let size = content.len().to_string();
                let headers = header_map(&[
                    (LOCATION.as_str(), location.as_str()),
                    (HEADER_REPO_COMMIT, commit.as_str()),
                    (HEADER_LINKED_ETAG, etag.as_str()),
                    (HEADER_LINKED_SIZE, size.as_str()),
                ]);
                Ok(response(StatusCode::FOUND, headers, "head"))
            }
            None => {
                let headers = header_map(&[
                    (HEADER_ERROR_CODE, "EntryNotFound"),
                    (HEADER_REPO_COMMIT, commit.as_str()),
                ]);
                Ok(response(StatusCode::NOT_FOUND, headers, "head"))
            }
        }
    }

    fn content(&self, name: &str, range: Option<String>) -> HubResult<(HubResponse, ByteStream)> {
        *self
            .get_calls
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        self.ranges
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(range.clone());

        let mut faults = self.faults.lock().unwrap();
        if Self::take_fault(&mut faults.get_transient, name) {
            return Err(HubError::Transport("connection timed out".into()));
        }
        if faults.forbidden.contains(name) {
            return Ok(empty(StatusCode::FORBIDDEN, HeaderMap::new(), "cdn"));
        }

        let Some(mut content) = self.published.lock().unwrap().files.get(name).cloned() else {
            return Ok(empty(StatusCode::NOT_FOUND, HeaderMap::new(), "cdn"));
        };
        if let Some(extra) = faults.pad.get(name) {
            content.extend(std::iter::repeat_n(b'!', *extra));
        }

        let start = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
            .unwrap_or(0);
        if start > 0 && start >= content.len() {
            return Ok(empty(StatusCode::RANGE_NOT_SATISFIABLE, HeaderMap::new(), "cdn"));
        }

        let status = if start > 0 {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        let mut body = content[start..].to_vec();
        if let Some(limit) = faults.truncate_once.remove(name) {
            body.truncate(limit);
        }

        let head = response(status, HeaderMap::new(), "cdn");
        match faults.stall_after.get(name) {
            Some(limit) if *limit < body.len() => {
                body.truncate(*limit);
                let stream = chunked(body).chain(futures::stream::pending()).boxed();
                Ok((head, stream))
            }
            _ => Ok((head, chunked(body).boxed())),
        }
    }

    fn search(&self, url: &str) -> (HubResponse, ByteStream) {
        let pages = self.search_pages.lock().unwrap();
        let page: usize = url
            .split_once("page=")
            .and_then(|(_, n)| n.parse().ok())
            .unwrap_or(0);

        let mut headers = HeaderMap::new();
        if page + 1 < pages.len() {
            let link = format!("<{}/api/models?page={}>; rel=\"next\"", ENDPOINT, page + 1);
            headers.insert(LINK, HeaderValue::from_str(&link).unwrap());
        }
        let items = pages.get(page).cloned().unwrap_or_default();
        body_response(
            StatusCode::OK,
            headers,
            "search",
            serde_json::to_vec(&items).unwrap(),
        )
    }
}

#[async_trait]
impl Transport for MockHub {
    async fn head(&self, url: &str, _headers: HeaderMap) -> HubResult<HubResponse> {
        let Some((repo_id, revision, name)) = parse_resolve_url(url) else {
            return Ok(response(StatusCode::NOT_FOUND, HeaderMap::new(), url));
        };
        self.resolve_head(&repo_id, &revision, &name)
    }

    async fn get(&self, url: &str, headers: HeaderMap) -> HubResult<(HubResponse, ByteStream)> {
        if let Some(rest) = url.strip_prefix(&format!("{}/api/models/", ENDPOINT)) {
            let (repo_id, revision) = match rest.split_once("/revision/") {
                Some((repo_id, revision)) => (repo_id.to_string(), decode(revision)),
                None => (rest.to_string(), "main".to_string()),
            };
            return Ok(self.repo_info(&repo_id, &revision));
        }
        if url.starts_with(&format!("{}/api/models", ENDPOINT)) {
            return Ok(self.search(url));
        }
        if let Some(rest) = url.strip_prefix(&format!("{}/", CDN)) {
            let mut parts = rest.splitn(3, '/');
            let (_, _, name) = (parts.next(), parts.next(), parts.next().unwrap_or_default());
            let range = headers
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return self.content(&decode(name), range);
        }
        Ok(empty(StatusCode::NOT_FOUND, HeaderMap::new(), url))
    }
}

fn parse_resolve_url(url: &str) -> Option<(String, String, String)> {
    let rest = url.strip_prefix(&format!("{}/", ENDPOINT))?;
    let (repo_id, rest) = rest.split_once("/resolve/")?;
    let (revision, name) = rest.split_once('/')?;
    Some((repo_id.to_string(), decode(revision), decode(name)))
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    headers
}

fn response(status: StatusCode, headers: HeaderMap, url: &str) -> HubResponse {
    HubResponse {
        status,
        headers,
        url: url.to_string(),
    }
}

fn empty(status: StatusCode, headers: HeaderMap, url: &str) -> (HubResponse, ByteStream) {
    body_response(status, headers, url, Vec::new())
}

fn body_response(
    status: StatusCode,
    headers: HeaderMap,
    url: &str,
    body: Vec<u8>,
) -> (HubResponse, ByteStream) {
    (response(status, headers, url), chunked(body).boxed())
}

fn chunked(body: Vec<u8>) -> futures::stream::Iter<std::vec::IntoIter<HubResult<Bytes>>> {
    let chunks: Vec<HubResult<Bytes>> = body
        .chunks(CHUNK_SIZE)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures::stream::iter(chunks)
}

// ============================================================================
// Wiring
// ============================================================================

pub fn fast_options() -> DownloadOptions {
    DownloadOptions {
        retry_interval: Duration::from_millis(5),
        lock_timeout: Some(Duration::from_secs(10)),
        lock_poll_interval: Duration::from_millis(10),
    }
}

pub fn api(hub: &Arc<MockHub>) -> Arc<HubApi> {
    let transport: Arc<dyn Transport> = hub.clone();
    Arc::new(HubApi::new(
        transport,
        ApiOptions {
            endpoint: ENDPOINT.to_string(),
            token: Some("hf_test_token".to_string()),
            user_agent_extra: None,
        },
    ))
}

pub fn file_downloader(hub: &Arc<MockHub>, cache_dir: &Path) -> FileDownloader {
    FileDownloader::new(api(hub), cache_dir, fast_options())
}

pub fn snapshot_downloader(
    hub: &Arc<MockHub>,
    cache_dir: &Path,
    options: SnapshotOptions,
) -> SnapshotDownloader {
    SnapshotDownloader::new(file_downloader(hub, cache_dir), options)
}

pub fn layout(cache_dir: &Path) -> CacheLayout {
    CacheLayout::new(cache_dir)
}

/// Poll `condition` every few milliseconds for up to five seconds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
