//! # SwKit Service Worker
//!
//! Offline cache gateway for a progressive web application, modelled on the
//! service worker lifecycle.
//!
//! ## Features
//!
//! - **Install**: precache the asset manifest into a versioned cache
//! - **Fetch**: cache first, network fallback, offline fallback document
//! - **Activate**: delete stale caches, claim controlled pages
//! - **Messages**: `skipWaiting` and `clearCache` control actions
//! - **Sync/Push**: extension points
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (lifecycle, event dispatch)
//!     │
//!     ├── Registration
//!     │       ├── installing ─┐
//!     │       ├── waiting ────┼── Gateway (handlers)
//!     │       └── active ─────┘      ├── dyn CacheStorage
//!     │                              ├── dyn Fetcher
//!     └── Clients                    └── dyn Clock
//!
//! CacheStorage (memory or disk)
//!     └── "turni-vvf-v2"
//!             └── RequestKey → CacheEntry
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod disk;
pub mod gateway;
pub mod host;
pub mod lifecycle;
pub mod scope;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, CacheEntry, CacheError, CacheResult, CacheStorage, MemoryCacheStorage, RequestKey};
pub use clients::{Client, Clients};
pub use config::{GatewayConfig, PrecachePolicy};
pub use disk::DiskCacheStorage;
pub use gateway::{
    ActivateReport, ControlMessage, FetchDisposition, Gateway, InstallReport, MessageOutcome,
    PrecacheFailure, SyncOutcome,
};
pub use host::{ServiceWorkerEvent, WorkerHost};
pub use lifecycle::{
    RegisteredWorker, Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState, StateChange,
};
pub use scope::{HostPattern, ScopeDecision, ScopeFilter};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] swkit_common::SwKitError),
}

// ==================== Clock ====================

/// Time source for cache capture timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}
