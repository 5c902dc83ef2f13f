//! Configuration structures and loading logic
//!
//! The library core never reads the environment itself. [`HubConfig::load`]
//! collects file and environment settings once, and the binary hands the
//! derived option structs to the resolver and downloaders.

use crate::download::{DownloadOptions, SnapshotOptions};
use crate::hub::{ApiOptions, TransportOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,
    pub cache_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_workers: usize,
    pub accelerated_transfer: bool,
    pub offline: bool,
    pub retry_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent_extra: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            cache_dir: default_cache_dir(),
            token: None,
            token_file: None,
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_workers: default_max_workers(),
            accelerated_transfer: false,
            offline: false,
            retry_interval_ms: default_retry_interval_ms(),
            lock_timeout_secs: None,
            proxy: None,
            user_agent_extra: None,
        }
    }
}

impl HubConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(endpoint) = std::env::var("HF_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(cache) = std::env::var("HF_HUB_CACHE") {
            config.cache_dir = PathBuf::from(cache);
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            config.cache_dir = PathBuf::from(hf_home).join("hub");
        }
        if let Ok(token) = std::env::var("HF_TOKEN") {
            config.token = Some(token);
        }
        if let Ok(token_path) = std::env::var("HF_TOKEN_PATH") {
            config.token_file = Some(PathBuf::from(token_path));
        }
        if let Ok(flag) = std::env::var("HF_HUB_ENABLE_HF_TRANSFER") {
            config.accelerated_transfer = parse_flag(&flag);
        }
        if let Ok(flag) = std::env::var("HF_HUB_OFFLINE") {
            config.offline = parse_flag(&flag);
        }
        if let Ok(timeout) = std::env::var("HF_HUB_ETAG_TIMEOUT") {
            config.request_timeout_secs = timeout
                .parse()
                .context("Invalid HF_HUB_ETAG_TIMEOUT value")?;
        }
        if let Ok(timeout) = std::env::var("HF_HUB_DOWNLOAD_TIMEOUT") {
            config.download_timeout_secs = timeout
                .parse()
                .context("Invalid HF_HUB_DOWNLOAD_TIMEOUT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            anyhow::bail!("Endpoint must be an http(s) URL (got '{}')", self.endpoint);
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }
        if self.cache_dir.as_os_str().is_empty() {
            anyhow::bail!("cache_dir cannot be empty");
        }
        Ok(())
    }

    /// Resolve the bearer token: explicit value first, then the token file
    pub fn resolve_token(&self) -> Result<Option<String>> {
        if let Some(token) = self.token.as_deref().map(str::trim)
            && !token.is_empty()
        {
            return Ok(Some(token.to_string()));
        }

        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        read_token_file(path)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(self.request_timeout_secs),
            read_timeout: Duration::from_secs(self.download_timeout_secs),
            proxy: self.proxy.clone(),
        }
    }

    pub fn api_options(&self) -> Result<ApiOptions> {
        Ok(ApiOptions {
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            token: self.resolve_token()?,
            user_agent_extra: self.user_agent_extra.clone(),
        })
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            lock_timeout: self.lock_timeout_secs.map(Duration::from_secs),
            ..DownloadOptions::default()
        }
    }

    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            max_workers: self.max_workers,
            accelerated_transfer: self.accelerated_transfer,
        }
    }
}

fn read_token_file(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let token = content.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read token file: {:?}", path)),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Default hub cache directory
///
/// Checks in order:
/// 1. `$HF_HUB_CACHE`
/// 2. `$HF_HOME/hub`
/// 3. `$XDG_CACHE_HOME/huggingface/hub`
/// 4. `~/.cache/huggingface/hub`
pub fn default_cache_dir() -> PathBuf {
    if let Ok(cache) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(cache);
    }

    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return PathBuf::from(hf_home).join("hub");
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("huggingface/hub");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache/huggingface/hub"))
        .unwrap_or_else(|| std::env::temp_dir().join("huggingface/hub"))
}

// Default functions
fn default_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_download_timeout() -> u64 {
    60
}
fn default_max_workers() -> usize {
    8
}
fn default_retry_interval_ms() -> u64 {
    1000
}
