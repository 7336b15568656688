//! Cache Storage: named caches of captured responses, keyed by request.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use swkit_net::{Request, Response, ResponseType};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

// ==================== Errors ====================

/// Cache storage errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Unsupported request: {0}")]
    UnsupportedRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

// ==================== Keys and entries ====================

/// Request identity used as the cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    #[serde(default)]
    pub status_text: String,

    /// Response headers, in wire order.
    pub headers: Vec<(String, String)>,

    /// Response type (`basic`, `cors`, `opaque`).
    pub response_type: String,

    /// Response body.
    #[serde(with = "base64_body")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` under `key`.
    ///
    /// Header values are kept when they are valid UTF-8, including non-ASCII
    /// text. Values that are not UTF-8 cannot be stored and are dropped.
    pub fn capture(key: &RequestKey, response: &Response, cached_at: u64) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| match std::str::from_utf8(value.as_bytes()) {
                Ok(v) => Some((name.as_str().to_string(), v.to_string())),
                Err(_) => {
                    debug!(url = %key.url, header = %name, "Dropping non-UTF-8 header from cached copy");
                    None
                }
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            response_type: response.response_type.as_str().to_string(),
            body: response.body.clone(),
            cached_at,
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild the response, marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers,
            response_type: ResponseType::from_name(&self.response_type)
                .unwrap_or(ResponseType::Basic),
            body: self.body.clone(),
            from_cache: true,
        }
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Storage trait ====================

/// Persistent store of named caches.
///
/// Writes are overwrites keyed by [`RequestKey`], so concurrent writers of the
/// same response converge on one entry.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the named cache if it does not exist.
    async fn open(&self, name: &str) -> CacheResult<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> CacheResult<bool>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> CacheResult<bool>;

    /// All cache names, in creation order.
    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Match a request in one cache.
    async fn match_in(&self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>>;

    /// Store an entry in an existing cache, replacing any entry with the same key.
    async fn put(&self, name: &str, entry: CacheEntry) -> CacheResult<()>;

    /// Delete one entry. Returns whether it existed.
    async fn delete_entry(&self, name: &str, key: &RequestKey) -> CacheResult<bool>;

    /// Keys stored in one cache, sorted.
    async fn entries(&self, name: &str) -> CacheResult<Vec<RequestKey>>;

    /// Match a request across all caches, oldest cache first.
    async fn match_any(&self, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        for name in self.keys().await? {
            if let Some(entry) = self.match_in(&name, key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

// ==================== Cache handle ====================

/// An opened cache, bound to one name in a [`CacheStorage`].
#[derive(Clone)]
pub struct Cache {
    storage: Arc<dyn CacheStorage>,
    name: String,
}

impl Cache {
    /// Open a cache (creates if it doesn't exist).
    pub async fn open(storage: Arc<dyn CacheStorage>, name: &str) -> CacheResult<Self> {
        storage.open(name).await?;
        Ok(Self {
            storage,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> CacheResult<Option<Response>> {
        let key = RequestKey::from_request(request);
        Ok(self
            .storage
            .match_in(&self.name, &key)
            .await?
            .map(|entry| entry.to_response()))
    }

    /// Store a copy of `response` under `request`. Only GET requests can be cached.
    pub async fn put(&self, request: &Request, response: &Response, cached_at: u64) -> CacheResult<()> {
        let key = RequestKey::from_request(request);
        if !key.is_get() {
            return Err(CacheError::UnsupportedRequest(format!(
                "cannot cache {key}: only GET requests are cacheable"
            )));
        }
        trace!(cache = %self.name, key = %key, status = response.status, "Cache put");
        self.storage
            .put(&self.name, CacheEntry::capture(&key, response, cached_at))
            .await
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> CacheResult<bool> {
        self.storage
            .delete_entry(&self.name, &RequestKey::from_request(request))
            .await
    }

    /// Get all keys.
    pub async fn keys(&self) -> CacheResult<Vec<RequestKey>> {
        self.storage.entries(&self.name).await
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish()
    }
}

// ==================== In-memory storage ====================

/// One named cache.
#[derive(Debug, Default, Clone)]
pub(crate) struct CacheTable {
    /// Creation sequence, for ordering cache names.
    pub(crate) created: u64,
    pub(crate) entries: HashMap<RequestKey, CacheEntry>,
}

/// The map behind both storage implementations.
#[derive(Debug, Default)]
pub(crate) struct CacheTables {
    next_seq: u64,
    tables: HashMap<String, CacheTable>,
}

impl CacheTables {
    /// Returns true when the cache was created by this call.
    pub(crate) fn open(&mut self, name: &str) -> bool {
        if self.tables.contains_key(name) {
            return false;
        }
        let created = self.next_seq;
        self.next_seq += 1;
        self.tables.insert(
            name.to_string(),
            CacheTable {
                created,
                entries: HashMap::new(),
            },
        );
        true
    }

    /// Insert a table loaded from elsewhere, keeping its creation sequence.
    pub(crate) fn restore(&mut self, name: String, table: CacheTable) {
        self.next_seq = self.next_seq.max(table.created + 1);
        self.tables.insert(name, table);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&CacheTable> {
        self.tables.get(name)
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub(crate) fn delete(&mut self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<(&String, u64)> =
            self.tables.iter().map(|(n, t)| (n, t.created)).collect();
        names.sort_by_key(|(_, created)| *created);
        names.into_iter().map(|(n, _)| n.clone()).collect()
    }

    pub(crate) fn match_in(&self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(table.entries.get(key).cloned())
    }

    /// Returns the entry that was replaced.
    pub(crate) fn put(&mut self, name: &str, entry: CacheEntry) -> CacheResult<Option<CacheEntry>> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(table.entries.insert(entry.key(), entry))
    }

    /// Returns the removed entry.
    pub(crate) fn delete_entry(&mut self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(table.entries.remove(key))
    }

    /// Put back what a `put` or `delete_entry` changed.
    pub(crate) fn revert_entry(&mut self, name: &str, key: &RequestKey, before: Option<CacheEntry>) {
        if let Some(table) = self.tables.get_mut(name) {
            match before {
                Some(entry) => table.entries.insert(key.clone(), entry),
                None => table.entries.remove(key),
            };
        }
    }

    pub(crate) fn entries(&self, name: &str) -> CacheResult<Vec<RequestKey>> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        let mut keys: Vec<RequestKey> = table.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Cache storage held in memory; contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    tables: RwLock<CacheTables>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> CacheResult<()> {
        if self.tables.write().await.open(name) {
            debug!(cache = %name, "Cache created");
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> CacheResult<bool> {
        Ok(self.tables.read().await.has(name))
    }

    async fn delete(&self, name: &str) -> CacheResult<bool> {
        Ok(self.tables.write().await.delete(name))
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.tables.read().await.names())
    }

    async fn match_in(&self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        self.tables.read().await.match_in(name, key)
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> CacheResult<()> {
        self.tables.write().await.put(name, entry).map(|_| ())
    }

    async fn delete_entry(&self, name: &str, key: &RequestKey) -> CacheResult<bool> {
        Ok(self.tables.write().await.delete_entry(name, key)?.is_some())
    }

    async fn entries(&self, name: &str) -> CacheResult<Vec<RequestKey>> {
        self.tables.read().await.entries(name)
    }

    async fn match_any(&self, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        let tables = self.tables.read().await;
        for name in tables.names() {
            if let Some(entry) = tables.match_in(&name, key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn storage() -> Arc<dyn CacheStorage> {
        Arc::new(MemoryCacheStorage::new())
    }

    #[test]
    fn test_request_key_strips_fragment() {
        let a = RequestKey::get(&url("https://turni.example.org/index.html#today"));
        let b = RequestKey::get(&url("https://turni.example.org/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://turni.example.org/index.html");
    }

    #[test]
    fn test_request_key_distinguishes_method_and_query() {
        let u = url("https://turni.example.org/api?month=3");
        assert_ne!(RequestKey::get(&u), RequestKey::new(&Method::POST, &u));
        assert_ne!(
            RequestKey::get(&u),
            RequestKey::get(&url("https://turni.example.org/api?month=4"))
        );
    }

    #[test]
    fn test_entry_captures_response() {
        let key = RequestKey::get(&url("https://turni.example.org/manifest.json"));
        let response = Response::new(200, "{\"name\":\"Turni\"}").with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/manifest+json"),
        );

        let entry = CacheEntry::capture(&key, &response, 1_700_000_000_000);
        assert_eq!(entry.key(), key);
        assert_eq!(entry.response_type, "basic");

        let restored = entry.to_response();
        assert!(restored.from_cache);
        assert_eq!(restored.status, 200);
        assert_eq!(restored.status_text, "OK");
        assert_eq!(restored.content_type(), Some("application/manifest+json"));
        assert_eq!(restored.body, response.body);
    }

    #[test]
    fn test_entry_keeps_non_ascii_header_values() {
        let key = RequestKey::get(&url("https://turni.example.org/turni/2024-03.json"));
        let filename = "attachment; filename=\"turni-marzo-caffè.json\"";
        let disposition = HeaderValue::from_bytes(filename.as_bytes()).unwrap();
        let response = Response::new(200, "[]")
            .with_header(http::header::CONTENT_DISPOSITION, disposition.clone())
            .with_header(
                HeaderName::from_static("x-raw"),
                HeaderValue::from_bytes(&[b'a', 0xff, b'b']).unwrap(),
            );

        let entry = CacheEntry::capture(&key, &response, 0);
        assert!(entry
            .headers
            .contains(&("content-disposition".to_string(), filename.to_string())));
        assert!(entry.headers.iter().all(|(name, _)| name != "x-raw"));

        let restored = entry.to_response();
        assert_eq!(restored.headers.get(http::header::CONTENT_DISPOSITION), Some(&disposition));
    }

    #[test]
    fn test_entry_json_encodes_body_as_base64() {
        let key = RequestKey::get(&url("https://turni.example.org/icon-192.png"));
        let entry = CacheEntry::capture(&key, &Response::new(200, vec![0x89u8, b'P', b'N', b'G']), 7);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "iVBORw==");

        let decoded: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, entry);
    }

    #[tokio::test]
    async fn test_cache_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("turni-vvf-v1").await.unwrap());
        storage.open("turni-vvf-v1").await.unwrap();
        assert!(storage.has("turni-vvf-v1").await.unwrap());

        assert!(storage.delete("turni-vvf-v1").await.unwrap());
        assert!(!storage.delete("turni-vvf-v1").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        for name in ["turni-vvf-v3", "turni-vvf-v1", "turni-vvf-v2"] {
            storage.open(name).await.unwrap();
        }
        storage.open("turni-vvf-v3").await.unwrap();

        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["turni-vvf-v3", "turni-vvf-v1", "turni-vvf-v2"]
        );
    }

    #[tokio::test]
    async fn test_put_requires_open_cache() {
        let storage = MemoryCacheStorage::new();
        let key = RequestKey::get(&url("https://turni.example.org/"));
        let entry = CacheEntry::capture(&key, &Response::new(200, "x"), 0);

        assert!(matches!(
            storage.put("missing", entry).await,
            Err(CacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_handle_put_and_match() {
        let cache = Cache::open(storage(), "turni-vvf-v1").await.unwrap();
        let request = Request::get(url("https://turni.example.org/index.html"));

        assert!(cache.match_request(&request).await.unwrap().is_none());

        cache
            .put(&request, &Response::new(200, "<html>"), 1)
            .await
            .unwrap();

        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "<html>");
        assert_eq!(cache.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_put_overwrites() {
        let cache = Cache::open(storage(), "turni-vvf-v1").await.unwrap();
        let request = Request::get(url("https://turni.example.org/app.js"));

        cache.put(&request, &Response::new(200, "v1"), 1).await.unwrap();
        cache.put(&request, &Response::new(200, "v2"), 2).await.unwrap();

        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let hit = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_non_get_put_rejected() {
        let cache = Cache::open(storage(), "turni-vvf-v1").await.unwrap();
        let request = Request::post(url("https://turni.example.org/api"), Bytes::from_static(b"{}"));

        let result = cache.put(&request, &Response::new(200, "ok"), 0).await;
        assert!(matches!(result, Err(CacheError::UnsupportedRequest(_))));
    }

    #[tokio::test]
    async fn test_cache_delete_entry() {
        let cache = Cache::open(storage(), "turni-vvf-v1").await.unwrap();
        let request = Request::get(url("https://turni.example.org/style.css"));

        cache.put(&request, &Response::new(200, "body{}"), 0).await.unwrap();
        assert!(cache.delete(&request).await.unwrap());
        assert!(cache.match_request(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_any_prefers_oldest_cache() {
        let storage = storage();
        let key_url = url("https://turni.example.org/index.html");
        let request = Request::get(key_url.clone());

        let old = Cache::open(storage.clone(), "turni-vvf-v1").await.unwrap();
        let new = Cache::open(storage.clone(), "turni-vvf-v2").await.unwrap();
        new.put(&request, &Response::new(200, "new"), 2).await.unwrap();
        old.put(&request, &Response::new(200, "old"), 1).await.unwrap();

        let hit = storage.match_any(&RequestKey::get(&key_url)).await.unwrap().unwrap();
        assert_eq!(&hit.body[..], b"old");

        storage.delete("turni-vvf-v1").await.unwrap();
        let hit = storage.match_any(&RequestKey::get(&key_url)).await.unwrap().unwrap();
        assert_eq!(&hit.body[..], b"new");
    }
}
