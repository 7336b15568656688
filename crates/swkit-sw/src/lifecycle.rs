//! Worker states and the registration that tracks installing, waiting and
//! active workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::gateway::Gateway;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// A recorded state transition, surfaced to the host's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub worker_id: ServiceWorkerId,
    pub version: String,
    pub new_state: ServiceWorkerState,
}

// ==================== Service Worker ====================

/// A service worker instance: one deployed version of the gateway.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache name of the version this worker runs.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state, returning the transition.
    pub fn set_state(&mut self, state: ServiceWorkerState) -> StateChange {
        debug!(worker = self.id.raw(), version = %self.version, from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
        StateChange {
            worker_id: self.id,
            version: self.version.clone(),
            new_state: state,
        }
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// A worker together with the handlers it runs.
#[derive(Clone)]
pub struct RegisteredWorker {
    pub worker: ServiceWorker,
    pub gateway: Arc<Gateway>,
}

impl RegisteredWorker {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            worker: ServiceWorker::new(gateway.cache_name()),
            gateway,
        }
    }
}

impl std::fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<RegisteredWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<RegisteredWorker>,

    /// Active worker.
    pub active: Option<RegisteredWorker>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Start installing a new worker; a previous installing worker becomes redundant.
    pub fn begin_install(&mut self, mut slot: RegisteredWorker) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if let Some(mut old) = self.installing.take() {
            changes.push(old.worker.set_state(ServiceWorkerState::Redundant));
        }
        changes.push(slot.worker.set_state(ServiceWorkerState::Installing));
        self.installing = Some(slot);
        changes
    }

    /// Transition installing to waiting. A superseded worker (no longer the
    /// installing one) is left alone.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if self.installing.as_ref().map(|s| s.worker.id) != Some(id) {
            return changes;
        }
        if let Some(mut slot) = self.installing.take() {
            if let Some(mut old) = self.waiting.take() {
                changes.push(old.worker.set_state(ServiceWorkerState::Redundant));
            }
            changes.push(slot.worker.set_state(ServiceWorkerState::Installed));
            self.waiting = Some(slot);
        }
        changes
    }

    /// Install failed: the worker becomes redundant.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Vec<StateChange> {
        match self.installing.take() {
            Some(mut slot) if slot.worker.id == id => {
                vec![slot.worker.set_state(ServiceWorkerState::Redundant)]
            }
            other => {
                self.installing = other;
                Vec::new()
            }
        }
    }

    /// Promote the waiting worker to active in `Activating` state; the old
    /// active worker becomes redundant.
    pub fn begin_activate(&mut self) -> Option<(RegisteredWorker, Vec<StateChange>)> {
        let mut slot = self.waiting.take()?;
        let mut changes = Vec::new();
        if let Some(mut old) = self.active.take() {
            changes.push(old.worker.set_state(ServiceWorkerState::Redundant));
        }
        changes.push(slot.worker.set_state(ServiceWorkerState::Activating));
        self.active = Some(slot.clone());
        Some((slot, changes))
    }

    /// Activation handler finished.
    pub fn finish_activate(&mut self, id: ServiceWorkerId) -> Option<StateChange> {
        match self.active.as_mut() {
            Some(slot) if slot.worker.id == id => {
                Some(slot.worker.set_state(ServiceWorkerState::Activated))
            }
            _ => None,
        }
    }

    /// Place an already installed worker in the waiting slot, as after a host
    /// restart. It still has to go through activation.
    pub fn restore_installed(&mut self, mut slot: RegisteredWorker) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if let Some(mut old) = self.waiting.take() {
            changes.push(old.worker.set_state(ServiceWorkerState::Redundant));
        }
        changes.push(slot.worker.set_state(ServiceWorkerState::Installed));
        self.waiting = Some(slot);
        changes
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().map(|s| &s.worker)
    }

    /// Gateway that should receive fetch, sync and push events.
    pub fn active_gateway(&self) -> Option<Arc<Gateway>> {
        self.active.as_ref().map(|s| s.gateway.clone())
    }

    /// Gateway that should receive control messages: waiting first, then active.
    pub fn message_target(&self) -> Option<Arc<Gateway>> {
        self.waiting
            .as_ref()
            .or(self.active.as_ref())
            .map(|s| s.gateway.clone())
    }
}
