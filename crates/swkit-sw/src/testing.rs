//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use swkit_net::{Fetcher, NetError, Request, Response};

use crate::cache::{CacheEntry, CacheError, CacheResult, RequestKey};
use crate::{CacheStorage, Clock, Gateway, GatewayConfig, MemoryCacheStorage};

#[derive(Clone)]
enum Route {
    Respond(Response),
    Fail,
}

/// Fetcher answering from a fixed route table. Unknown URLs fail like a
/// refused connection.
#[derive(Default)]
pub(crate) struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &str, response: Response) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Respond(response));
        self
    }

    pub(crate) fn fail(&self, url: &str) -> &Self {
        self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(request.url.to_string());
        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        match route {
            Some(Route::Respond(response)) => Ok(response.with_url(request.url.clone())),
            Some(Route::Fail) | None => Err(NetError::RequestFailed(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }
}

/// In-memory storage whose writes can be switched to fail like a full or
/// read-only disk.
#[derive(Default)]
pub(crate) struct FailingCacheStorage {
    inner: MemoryCacheStorage,
    fail_open: AtomicBool,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
}

impl FailingCacheStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_open(&self, fail: bool) -> &Self {
        self.fail_open.store(fail, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_put(&self, fail: bool) -> &Self {
        self.fail_put.store(fail, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_delete(&self, fail: bool) -> &Self {
        self.fail_delete.store(fail, Ordering::SeqCst);
        self
    }

    fn check(flag: &AtomicBool, what: &str) -> CacheResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CacheError::Io(std::io::Error::other(format!("{what}: no space left on device"))));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FailingCacheStorage {
    async fn open(&self, name: &str) -> CacheResult<()> {
        Self::check(&self.fail_open, "open")?;
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> CacheResult<bool> {
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> CacheResult<bool> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(name).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn match_in(&self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        self.inner.match_in(name, key).await
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> CacheResult<()> {
        Self::check(&self.fail_put, "put")?;
        self.inner.put(name, entry).await
    }

    async fn delete_entry(&self, name: &str, key: &RequestKey) -> CacheResult<bool> {
        Self::check(&self.fail_put, "delete_entry")?;
        self.inner.delete_entry(name, key).await
    }

    async fn entries(&self, name: &str) -> CacheResult<Vec<RequestKey>> {
        self.inner.entries(name).await
    }
}

/// Clock frozen at one instant.
pub(crate) struct FixedClock(pub(crate) u64);

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

pub(crate) const SCOPE: &str = "https://turni.example.org/";

/// Config for the test scope with a small app-shell manifest.
pub(crate) fn turni_config(version: &str) -> GatewayConfig {
    let mut config = GatewayConfig::for_scope(url::Url::parse(SCOPE).unwrap());
    config.cache_prefix = "turni-vvf".to_string();
    config.version = version.to_string();
    config.manifest = vec![
        "./index.html".to_string(),
        "./manifest.json".to_string(),
        "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js".to_string(),
    ];
    config.allowed_hosts = vec!["cdnjs.cloudflare.com".to_string(), "*.googleapis.com".to_string()];
    config
}

pub(crate) fn gateway_with(
    config: GatewayConfig,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
) -> Gateway {
    Gateway::new(config, caches, fetcher)
        .unwrap()
        .with_clock(Arc::new(FixedClock(1_700_000_000_000)))
}

pub(crate) fn url(path: &str) -> String {
    format!("{SCOPE}{path}")
}
