//! HTTP transport capability
//!
//! The resolver and downloaders only talk to the network through the
//! [`Transport`] trait so tests can inject an in-memory hub. [`HttpTransport`]
//! is the production implementation over `reqwest`.

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Response body as a stream of chunks
pub type ByteStream = BoxStream<'static, HubResult<Bytes>>;

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct HubResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL after any redirects the transport followed
    pub url: String,
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Injected HTTP capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a HEAD request. Must NOT follow redirects: hub headers live on
    /// the redirect response itself.
    async fn head(&self, url: &str, headers: HeaderMap) -> HubResult<HubResponse>;

    /// Issue a GET request, following redirects, and stream the body
    async fn get(&self, url: &str, headers: HeaderMap) -> HubResult<(HubResponse, ByteStream)>;
}

/// Read a whole body into memory
pub async fn collect_body(mut stream: ByteStream) -> HubResult<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Immutable client settings. Changing them means building a new transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    /// Maximum idle time between body chunks
    pub read_timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            proxy: None,
        }
    }
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Client for HEAD probes, redirects disabled
    probe: reqwest::Client,
    /// Client for content, redirects followed
    content: reqwest::Client,
    options: TransportOptions,
}

impl HttpTransport {
    pub fn new(options: TransportOptions) -> HubResult<Self> {
        let probe = Self::builder(&options)?
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let content = Self::builder(&options)?.build()?;

        Ok(Self {
            probe,
            content,
            options,
        })
    }

    /// Build a fresh transport with different settings
    pub fn with_options(&self, options: TransportOptions) -> HubResult<Self> {
        Self::new(options)
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn builder(options: &TransportOptions) -> HubResult<reqwest::ClientBuilder> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout);

        if let Some(proxy) = &options.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str, headers: HeaderMap) -> HubResult<HubResponse> {
        let response = self.probe.head(url).headers(headers).send().await?;

        Ok(HubResponse {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().to_string(),
        })
    }

    async fn get(&self, url: &str, headers: HeaderMap) -> HubResult<(HubResponse, ByteStream)> {
        let response = self.content.get(url).headers(headers).send().await?;

        let meta = HubResponse {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().to_string(),
        };
        let stream = response.bytes_stream().map_err(HubError::from).boxed();

        Ok((meta, stream))
    }
}
