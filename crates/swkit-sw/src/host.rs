//! Lifecycle host: drives registration state changes and dispatches events to
//! the right gateway.

use std::sync::Arc;

use swkit_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clients::{in_scope, Client, Clients};
use crate::gateway::{FetchDisposition, Gateway, MessageOutcome, SyncOutcome};
use crate::lifecycle::{
    RegisteredWorker, Registration, ServiceWorker, ServiceWorkerId, StateChange,
};
use crate::ServiceWorkerError;

/// Event broadcast by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange(StateChange),
    /// A client is now controlled by `worker_id`.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// Caches deleted during activation or by `clearCache`.
    CachesDeleted { names: Vec<String> },
}

/// Hosts one registration and its controlled pages.
pub struct WorkerHost {
    scope: Url,
    fetcher: Arc<dyn Fetcher>,
    registration: RwLock<Registration>,
    clients: RwLock<Clients>,
    sync_tags: Mutex<Vec<String>>,
    /// Serializes register/activate jobs.
    jobs: Mutex<()>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl WorkerHost {
    /// Create a host for `scope`. `fetcher` serves requests no worker handles.
    pub fn new(
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let host = Self {
            registration: RwLock::new(Registration::new(scope.clone())),
            scope,
            fetcher,
            clients: RwLock::new(Clients::new()),
            sync_tags: Mutex::new(Vec::new()),
            jobs: Mutex::new(()),
            events,
        };
        (host, rx)
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn emit_changes(&self, changes: Vec<StateChange>) {
        for change in changes {
            self.emit(ServiceWorkerEvent::StateChange(change));
        }
    }

    // ==================== Lifecycle ====================

    /// Install a new version. Activates it right away when the install asks
    /// to skip waiting or nothing is active yet.
    pub async fn register(&self, gateway: Gateway) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _job = self.jobs.lock().await;

        if gateway.config().scope != self.scope {
            return Err(ServiceWorkerError::StateError(format!(
                "gateway scope {} does not match registration scope {}",
                gateway.config().scope,
                self.scope
            )));
        }

        let slot = RegisteredWorker::new(Arc::new(gateway));
        let id = slot.worker.id;
        let gateway = slot.gateway.clone();
        info!(worker = id.raw(), version = %slot.worker.version, "Registering worker");

        let changes = self.registration.write().await.begin_install(slot);
        self.emit_changes(changes);

        let report = match gateway.install().await {
            Ok(report) => report,
            Err(e) => {
                error!(worker = id.raw(), error = %e, "Install failed, worker is redundant");
                let changes = self.registration.write().await.install_failed(id);
                self.emit_changes(changes);
                return Err(e);
            }
        };

        let changes = self.registration.write().await.install_complete(id);
        self.emit_changes(changes);

        let nothing_active = self.registration.read().await.active.is_none();
        if report.skip_waiting || nothing_active {
            self.activate_locked().await;
        } else {
            info!(worker = id.raw(), "Installed, waiting for skipWaiting");
        }
        Ok(id)
    }

    /// Activate the waiting worker, if any.
    pub async fn skip_waiting(&self) -> Option<ServiceWorkerId> {
        let _job = self.jobs.lock().await;
        self.activate_locked().await
    }

    async fn activate_locked(&self) -> Option<ServiceWorkerId> {
        let Some((slot, changes)) = self.registration.write().await.begin_activate() else {
            debug!("No waiting worker to activate");
            return None;
        };
        self.emit_changes(changes);
        let id = slot.worker.id;

        let report = slot.gateway.activate().await;
        if !report.deleted.is_empty() {
            self.emit(ServiceWorkerEvent::CachesDeleted {
                names: report.deleted,
            });
        }

        if let Some(change) = self.registration.write().await.finish_activate(id) {
            self.emit(ServiceWorkerEvent::StateChange(change));
        }
        info!(worker = id.raw(), version = %slot.worker.version, "Worker activated");

        if report.claim_clients {
            self.claim_clients(id).await;
        }
        Some(id)
    }

    async fn claim_clients(&self, worker: ServiceWorkerId) -> Vec<String> {
        let changed = self.clients.write().await.claim(&self.scope, worker);
        for client_id in &changed {
            debug!(client = %client_id, worker = worker.raw(), "Client claimed");
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: worker,
            });
        }
        changed
    }

    /// Restart with a previously installed version: if its cache exists the
    /// worker is activated without reinstalling, otherwise it is registered.
    /// Activation still runs, so caches of other versions are deleted.
    pub async fn resume(&self, gateway: Gateway) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let installed = match gateway.caches().has(gateway.cache_name()).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!(cache = gateway.cache_name(), error = %e, "Cannot check cache, reinstalling");
                false
            }
        };
        if !installed || gateway.config().scope != self.scope {
            return self.register(gateway).await;
        }

        let _job = self.jobs.lock().await;
        let slot = RegisteredWorker::new(Arc::new(gateway));
        let id = slot.worker.id;
        info!(worker = id.raw(), version = %slot.worker.version, "Resuming installed worker");
        let changes = self.registration.write().await.restore_installed(slot);
        self.emit_changes(changes);

        match self.activate_locked().await {
            Some(activated) if activated == id => Ok(id),
            _ => Err(ServiceWorkerError::StateError(format!(
                "resumed worker {} was not activated",
                id.raw()
            ))),
        }
    }

    // ==================== Functional events ====================

    /// Dispatch a fetch to the active worker, falling back to the network.
    pub async fn fetch(&self, request: &Request) -> Response {
        let gateway = self.registration.read().await.active_gateway();
        if let Some(gateway) = gateway {
            if let FetchDisposition::Respond(response) = gateway.handle_fetch(request).await {
                return response;
            }
        }
        self.pass_through(request).await
    }

    /// Run a fetch on its own task.
    pub fn spawn_fetch(self: &Arc<Self>, request: Request) -> JoinHandle<Response> {
        let host = Arc::clone(self);
        tokio::spawn(async move { host.fetch(&request).await })
    }

    async fn pass_through(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Pass-through fetch failed");
                Response::network_error()
            }
        }
    }

    /// Post a control message to the waiting worker, else the active one.
    pub async fn post_message(&self, payload: &str) -> MessageOutcome {
        let Some(gateway) = self.registration.read().await.message_target() else {
            warn!("No worker to receive message");
            return MessageOutcome::Ignored;
        };

        let outcome = gateway.handle_message(payload).await;
        match &outcome {
            MessageOutcome::SkipWaiting => {
                self.skip_waiting().await;
            }
            MessageOutcome::CachesCleared { deleted } if !deleted.is_empty() => {
                self.emit(ServiceWorkerEvent::CachesDeleted {
                    names: deleted.clone(),
                });
            }
            _ => {}
        }
        outcome
    }

    /// Queue a background sync tag until the next `fire_sync`.
    pub async fn register_sync(&self, tag: impl Into<String>) {
        let tag = tag.into();
        let mut tags = self.sync_tags.lock().await;
        if !tags.contains(&tag) {
            debug!(%tag, "Sync registered");
            tags.push(tag);
        }
    }

    /// Deliver queued sync tags to the active worker. Tags stay queued while
    /// nothing is active.
    pub async fn fire_sync(&self) -> Vec<(String, SyncOutcome)> {
        let Some(gateway) = self.registration.read().await.active_gateway() else {
            debug!("No active worker, sync deferred");
            return Vec::new();
        };

        let tags = std::mem::take(&mut *self.sync_tags.lock().await);
        let mut outcomes = Vec::with_capacity(tags.len());
        for tag in tags {
            let outcome = gateway.handle_sync(&tag).await;
            outcomes.push((tag, outcome));
        }
        outcomes
    }

    /// Deliver a push payload. Returns false when nothing is active.
    pub async fn push(&self, payload: Option<&[u8]>) -> bool {
        let gateway = self.registration.read().await.active_gateway();
        match gateway {
            Some(gateway) => {
                gateway.handle_push(payload).await;
                true
            }
            None => false,
        }
    }

    // ==================== Clients ====================

    /// Open a page. In-scope pages are controlled by the active worker.
    pub async fn connect_client(&self, url: Url) -> Client {
        let controller = if in_scope(&self.scope, &url) {
            self.registration.read().await.get_active().map(|w| w.id)
        } else {
            None
        };
        self.clients.write().await.connect(url, controller)
    }

    pub async fn disconnect_client(&self, client_id: &str) -> Option<Client> {
        self.clients.write().await.remove(client_id)
    }

    pub async fn controller_of(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|c| c.controller)
    }

    // ==================== Introspection ====================

    pub async fn active_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.get_active().cloned()
    }

    pub async fn waiting_worker(&self) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        registration.waiting.as_ref().map(|s| s.worker.clone())
    }

    pub async fn installing_worker(&self) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        registration.installing.as_ref().map(|s| s.worker.clone())
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost")
            .field("scope", &self.scope.as_str())
            .finish_non_exhaustive()
    }
}
