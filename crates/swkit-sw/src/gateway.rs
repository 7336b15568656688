//! The offline cache gateway: install, fetch, activate, message, sync and
//! push handlers.
//!
//! Every handler is an `async fn`; the returned future is the pending work the
//! host must await before it moves the worker to its next state.

use std::sync::Arc;

use futures::future::join_all;
use http::Method;
use serde::{Deserialize, Serialize};
use swkit_common::{retry_with_backoff, with_timeout};
use swkit_net::{Fetcher, Request, Response, ResponseType};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{Cache, CacheResult, CacheStorage, RequestKey};
use crate::config::{GatewayConfig, PrecachePolicy};
use crate::scope::{ScopeDecision, ScopeFilter};
use crate::{Clock, ServiceWorkerError, SystemClock};

// ==================== Outcomes ====================

/// A manifest entry that could not be precached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheFailure {
    pub url: String,
    pub reason: String,
}

/// Result of the install handler.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub cache_name: String,
    pub cached: Vec<Url>,
    pub failed: Vec<PrecacheFailure>,
    /// Activate without waiting for controlled pages to close.
    pub skip_waiting: bool,
}

/// Result of the activate handler.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    /// Take control of open pages once cleanup is done.
    pub claim_clients: bool,
}

/// What the fetch handler decided for a request.
#[derive(Debug, Clone)]
pub enum FetchDisposition {
    /// Answer the page with this response.
    Respond(Response),
    /// Not handled; the host performs the request itself.
    PassThrough,
}

impl FetchDisposition {
    pub fn response(self) -> Option<Response> {
        match self {
            FetchDisposition::Respond(response) => Some(response),
            FetchDisposition::PassThrough => None,
        }
    }
}

/// Control message posted by a page: `{ "action": "skipWaiting" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlMessage {
    SkipWaiting,
    ClearCache,
}

impl ControlMessage {
    /// Parse a JSON message payload.
    pub fn parse(payload: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(payload).map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))
    }

    pub fn to_json(self) -> String {
        match self {
            ControlMessage::SkipWaiting => r#"{"action":"skipWaiting"}"#.to_string(),
            ControlMessage::ClearCache => r#"{"action":"clearCache"}"#.to_string(),
        }
    }
}

/// Result of the message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The host should activate the waiting worker now.
    SkipWaiting,
    /// Every cache was deleted.
    CachesCleared { deleted: Vec<String> },
    /// Unknown or malformed message.
    Ignored,
}

/// Result of the sync handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    Ignored,
}

// ==================== Gateway ====================

/// One deployed version of the offline cache gateway.
pub struct Gateway {
    config: GatewayConfig,
    cache_name: String,
    fallback_url: Url,
    scope: ScopeFilter,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    /// Create a gateway from validated configuration and its capabilities.
    pub fn new(
        config: GatewayConfig,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let fallback_url = config.fallback_url()?;
        let scope = ScopeFilter::new(&config.scope, &config.allowed_hosts);

        Ok(Self {
            cache_name: config.cache_name(),
            fallback_url,
            scope,
            config,
            caches,
            fetcher,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<dyn CacheStorage> {
        &self.caches
    }

    // ---------- install ----------

    /// Precache the asset manifest into this version's cache.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let atomic = self.config.precache_policy == PrecachePolicy::Atomic;
        info!(
            assets = self.config.manifest.len(),
            policy = ?self.config.precache_policy,
            "Install: opening cache"
        );

        let mut report = InstallReport {
            cache_name: self.cache_name.clone(),
            cached: Vec::new(),
            failed: Vec::new(),
            skip_waiting: self.config.skip_waiting,
        };

        // An atomic install only discards a cache it created itself.
        let existed = matches!(self.caches.has(&self.cache_name).await, Ok(true));
        let cache = match Cache::open(self.caches.clone(), &self.cache_name).await {
            Ok(cache) => Some(cache),
            Err(e) if atomic => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Cache open failed, nothing will be precached");
                None
            }
        };

        let fetched = join_all(self.config.manifest_urls().into_iter().map(
            |(entry, url)| async move {
                let result = match url {
                    Ok(url) => self.precache_fetch(&url).await.map(|r| (url, r)),
                    Err(e) => Err(ServiceWorkerError::InstallFailed(format!(
                        "invalid manifest entry: {e}"
                    ))),
                };
                (entry, result)
            },
        ))
        .await;

        let mut ready = Vec::with_capacity(fetched.len());
        for (entry, result) in fetched {
            match result {
                Ok(pair) => ready.push(pair),
                Err(e) => {
                    warn!(asset = %entry, error = %e, "Precache fetch failed");
                    report.failed.push(PrecacheFailure {
                        url: entry,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if atomic && !report.failed.is_empty() {
            let error = ServiceWorkerError::InstallFailed(format!(
                "{} of {} assets could not be fetched, first: {}",
                report.failed.len(),
                self.config.manifest.len(),
                report.failed[0].url
            ));
            return Err(self.abandon_install(existed, error).await);
        }

        let Some(cache) = cache else {
            report
                .failed
                .extend(ready.into_iter().map(|(url, _)| PrecacheFailure {
                    url: url.to_string(),
                    reason: "cache unavailable".to_string(),
                }));
            return Ok(report);
        };

        for (url, response) in ready {
            let request = Request::get(url.clone());
            match cache.put(&request, &response, self.clock.now_millis()).await {
                Ok(()) => {
                    debug!(asset = %url, "Precached");
                    report.cached.push(url);
                }
                Err(e) if atomic => return Err(self.abandon_install(existed, e.into()).await),
                Err(e) => {
                    warn!(asset = %url, error = %e, "Precache write failed");
                    report.failed.push(PrecacheFailure {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Install complete"
        );
        Ok(report)
    }

    /// Drop the cache a failed atomic install opened, so a later start does
    /// not mistake it for a complete install.
    async fn abandon_install(&self, existed: bool, error: ServiceWorkerError) -> ServiceWorkerError {
        if !existed {
            match self.caches.delete(&self.cache_name).await {
                Ok(_) => info!("Discarded incomplete cache"),
                Err(e) => warn!(error = %e, "Cannot discard incomplete cache"),
            }
        }
        error
    }

    async fn precache_fetch(&self, url: &Url) -> Result<Response, ServiceWorkerError> {
        retry_with_backoff(&self.config.precache_retry(), || async move {
            let response = self.network(&Request::get(url.clone())).await?;
            if response.ok() {
                Ok(response)
            } else {
                Err(ServiceWorkerError::NetworkError(format!(
                    "{url} returned status {}",
                    response.status
                )))
            }
        })
        .await
    }

    // ---------- fetch ----------

    /// Cache first, then network, then the offline fallback. Never fails.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn handle_fetch(&self, request: &Request) -> FetchDisposition {
        if request.method != Method::GET {
            debug!("Non-GET request passed through");
            return FetchDisposition::PassThrough;
        }

        if self.scope.classify(&request.url) == ScopeDecision::OutOfScope {
            debug!("Out-of-scope request passed through");
            return FetchDisposition::PassThrough;
        }

        let key = RequestKey::from_request(request);
        match self.caches.match_any(&key).await {
            Ok(Some(entry)) => {
                debug!("Cache hit");
                return FetchDisposition::Respond(entry.to_response());
            }
            Ok(None) => debug!("Cache miss"),
            Err(e) => warn!(error = %e, "Cache lookup failed, treating as miss"),
        }

        match self.network(request).await {
            Ok(response) => {
                if is_cacheable(&response) {
                    self.store_copy(request, &response).await;
                } else {
                    debug!(
                        status = response.status,
                        response_type = response.response_type.as_str(),
                        "Response not cacheable"
                    );
                }
                FetchDisposition::Respond(response)
            }
            Err(e) => {
                warn!(error = %e, "Network fetch failed");
                FetchDisposition::Respond(self.offline_fallback().await)
            }
        }
    }

    async fn store_copy(&self, request: &Request, response: &Response) {
        let result: CacheResult<()> = async {
            let cache = Cache::open(self.caches.clone(), &self.cache_name).await?;
            cache.put(request, response, self.clock.now_millis()).await
        }
        .await;

        match result {
            Ok(()) => debug!(cache = %self.cache_name, "Stored network response"),
            Err(e) => warn!(cache = %self.cache_name, error = %e, "Cache write failed, response served uncached"),
        }
    }

    async fn offline_fallback(&self) -> Response {
        match self.caches.match_any(&RequestKey::get(&self.fallback_url)).await {
            Ok(Some(entry)) => {
                info!(fallback = %self.fallback_url, "Serving offline fallback");
                entry.to_response()
            }
            Ok(None) => {
                warn!(fallback = %self.fallback_url, "Offline fallback not cached");
                Response::network_error()
            }
            Err(e) => {
                warn!(fallback = %self.fallback_url, error = %e, "Offline fallback lookup failed");
                Response::network_error()
            }
        }
    }

    async fn network(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let fetch = self.fetcher.fetch(request);
        let result = match self.config.fetch_timeout() {
            Some(timeout) => with_timeout(timeout, fetch)
                .await
                .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?,
            None => fetch.await,
        };
        result.map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))
    }

    // ---------- activate ----------

    /// Delete every cache except this version's.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn activate(&self) -> ActivateReport {
        let mut report = ActivateReport {
            claim_clients: true,
            ..Default::default()
        };

        let names = match self.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Cannot list caches, skipping cleanup");
                return report;
            }
        };

        for name in names.into_iter().filter(|n| *n != self.cache_name) {
            match self.caches.delete(&name).await {
                Ok(_) => {
                    info!(stale = %name, "Deleted stale cache");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(stale = %name, error = %e, "Failed to delete stale cache");
                    report.failed.push(name);
                }
            }
        }

        info!(deleted = report.deleted.len(), "Activate complete");
        report
    }

    // ---------- message ----------

    /// Handle a raw JSON control message. Malformed or unknown messages are ignored.
    pub async fn handle_message(&self, payload: &str) -> MessageOutcome {
        match ControlMessage::parse(payload) {
            Ok(message) => self.handle_control(message).await,
            Err(e) => {
                warn!(error = %e, "Ignoring control message");
                MessageOutcome::Ignored
            }
        }
    }

    pub async fn handle_control(&self, message: ControlMessage) -> MessageOutcome {
        info!(?message, "Control message received");
        match message {
            ControlMessage::SkipWaiting => MessageOutcome::SkipWaiting,
            ControlMessage::ClearCache => MessageOutcome::CachesCleared {
                deleted: self.clear_all().await,
            },
        }
    }

    async fn clear_all(&self) -> Vec<String> {
        let names = match self.caches.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Cannot list caches");
                return Vec::new();
            }
        };

        let mut deleted = Vec::with_capacity(names.len());
        for name in names {
            match self.caches.delete(&name).await {
                Ok(_) => deleted.push(name),
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete cache"),
            }
        }
        info!(deleted = deleted.len(), "All caches cleared");
        deleted
    }

    // ---------- sync / push ----------

    pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring unknown sync tag");
            return SyncOutcome::Ignored;
        }
        self.sync_data().await;
        SyncOutcome::Completed
    }

    /// Extension point for synchronizing offline data.
    async fn sync_data(&self) {
        debug!(tag = %self.config.sync_tag, "Background sync ran, nothing to synchronize");
    }

    /// Push is reserved; the payload is logged and dropped.
    pub async fn handle_push(&self, payload: Option<&[u8]>) {
        debug!(bytes = payload.map_or(0, |p| p.len()), "Push received, no handler");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("cache_name", &self.cache_name)
            .field("scope", &self.config.scope.as_str())
            .finish_non_exhaustive()
    }
}

/// Only complete same-origin responses are stored on the fetch path.
fn is_cacheable(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic
}
