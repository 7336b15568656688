//! `reqwest`-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::{Origin, Url};

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout. `None` lets a request run indefinitely.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("SwKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "it-IT,it;q=0.9,en;q=0.8".to_string(),
            default_timeout: None,
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Fetches over HTTP and labels each response relative to the client origin.
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
    client_origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for pages served from `client_url`'s origin.
    pub fn new(config: FetcherConfig, client_url: &Url) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);

        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        let client_origin = client_url.origin();
        info!(origin = %client_origin.ascii_serialization(), "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            client_origin,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn response_type_for(&self, request: &Request, final_url: &Url) -> ResponseType {
        if final_url.origin() == self.client_origin {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout.or(self.config.default_timeout) {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            match request.timeout.or(self.config.default_timeout) {
                Some(timeout) if e.is_timeout() => NetError::Timeout(timeout),
                _ => NetError::HttpError(e),
            }
        })?;

        let url = response.url().clone();
        let response_type = self.response_type_for(request, &url);

        if response_type == ResponseType::Opaque {
            trace!(url = %url, "Opaque response, body discarded");
            return Ok(Response::opaque(url));
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            response_type,
            body,
            from_cache: false,
        })
    }
}
