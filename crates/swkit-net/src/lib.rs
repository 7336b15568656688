//! # SwKit Net
//!
//! Request and response model plus network fetchers for the SwKit offline
//! cache gateway.
//!
//! ## Design Goals
//!
//! 1. **Fetch-shaped types**: requests carry a mode, responses carry a type
//!    (`basic`, `cors`, `opaque`, `error`) the way a page sees them
//! 2. **Injectable network**: the gateway only talks to the [`Fetcher`] trait
//! 3. **Cheap duplication**: bodies are `Bytes`, so a response can be cached
//!    and returned without copying

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use url::Url;

pub mod fetcher;

pub use fetcher::{FetcherConfig, HttpFetcher};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as set by the page issuing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level or frame navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Cross-origin allowed with CORS.
    #[default]
    Cors,
    /// Cross-origin allowed, response is opaque.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            timeout: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a navigation request.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// How a response may be observed by the page that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response readable through CORS.
    Cors,
    /// Cross-origin `no-cors` response: status 0, no headers, no body.
    Opaque,
    /// Network error.
    Error,
}

impl ResponseType {
    /// Lowercase name, as used in logs and the persisted cache format.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }

    /// Inverse of [`ResponseType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// HTTP response with a fully buffered body.
///
/// Cloning is cheap: the body is reference counted, so the same response
/// can be stored in a cache and handed back to the caller.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL (after redirects), if any.
    pub url: Option<Url>,
    /// Status code; 0 for network errors and opaque responses.
    pub status: u16,
    /// Status text.
    pub status_text: String,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response type.
    pub response_type: ResponseType,
    /// Response body.
    pub body: Bytes,
    /// Whether this response was served from a cache.
    pub from_cache: bool,
}

impl Response {
    /// Create a same-origin response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            status_text: http::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: body.into(),
            from_cache: false,
        }
    }

    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            body: Bytes::new(),
            from_cache: false,
        }
    }

    /// Create an opaque response for a `no-cors` cross-origin request.
    pub fn opaque(url: Url) -> Self {
        Self {
            url: Some(url),
            response_type: ResponseType::Opaque,
            ..Self::network_error()
        }
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this is the synthetic network error response.
    pub fn is_network_error(&self) -> bool {
        self.response_type == ResponseType::Error
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get content-type from headers.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network capability used by the gateway.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. An HTTP error status is a successful fetch;
    /// only transport failures are errors.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
