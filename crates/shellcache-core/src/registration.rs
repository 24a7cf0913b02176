//! Host-side coordination of successive versions.
//!
//! A `Registration` holds at most one installing, one waiting, and one active
//! worker. New versions install next to the active one, wait until either no
//! client is still controlled by the old version or they asked to skip
//! waiting, and then activate, replacing the old version outright.
//!
//! The name of the active version is persisted to `registration.json` in the
//! cache root so a restarted host can resume it without reinstalling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::models::{Request, Response};
use crate::network::Network;
use crate::worker::{
    ClientId, Clients, ControlMessage, EventOutcome, FetchResult, ResponseSource, VersionState,
    Worker, WorkerError, WorkerEvent,
};

/// Registration file name in the cache root
const REGISTRATION_FILE: &str = "registration.json";

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub active_version: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl RegistrationState {
    pub fn load(cache_root: &Path) -> Result<Self> {
        let path = Self::path(cache_root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read registration file")?;
        serde_json::from_str(&contents).context("Failed to parse registration file")
    }

    pub fn save(&self, cache_root: &Path) -> Result<()> {
        std::fs::create_dir_all(cache_root)?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(cache_root), contents)?;
        Ok(())
    }

    fn path(cache_root: &Path) -> PathBuf {
        cache_root.join(REGISTRATION_FILE)
    }
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<Worker>>,
    waiting: Option<Arc<Worker>>,
    active: Option<Arc<Worker>>,
}

pub struct Registration {
    storage: CacheStorage,
    network: Arc<dyn Network>,
    clients: Clients,
    slots: Mutex<Slots>,
}

impl Registration {
    pub fn new(storage: CacheStorage, network: Arc<dyn Network>) -> Self {
        Self {
            storage,
            network,
            clients: Clients::new(),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Build a worker that shares this registration's storage, network, and clients.
    pub fn worker(&self, config: WorkerConfig) -> Result<Arc<Worker>, WorkerError> {
        Ok(Arc::new(Worker::new(
            config,
            self.storage.clone(),
            Arc::clone(&self.network),
            self.clients.clone(),
        )?))
    }

    pub async fn active(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.active.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.waiting.clone()
    }

    pub async fn installing(&self) -> Option<Arc<Worker>> {
        self.slots.lock().await.installing.clone()
    }

    /// Resume `worker` as the active version if the persisted state says it
    /// was active and its store still exists. Returns whether it was resumed.
    pub async fn restore(&self, worker: Arc<Worker>) -> Result<bool, WorkerError> {
        let state = RegistrationState::load(self.storage.root()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load registration state, starting fresh");
            RegistrationState::default()
        });
        if state.active_version.as_deref() != Some(worker.version()) {
            return Ok(false);
        }
        if !self.storage.has(worker.version()).await? {
            warn!(version = worker.version(), "Active version has no cache store, reinstalling");
            return Ok(false);
        }
        worker.restore_active().await?;
        self.slots.lock().await.active = Some(worker);
        Ok(true)
    }

    /// Install `worker` and activate it as soon as that is allowed.
    ///
    /// A failed install leaves the registration untouched; calling again with
    /// a fresh worker retries. Returns the worker's state afterwards:
    /// `Activated`, or `Installed` if it is still waiting.
    pub async fn register(&self, worker: Arc<Worker>) -> Result<VersionState, WorkerError> {
        if let Some(active) = self.active().await {
            if active.version() == worker.version() {
                debug!(version = worker.version(), "Version already active");
                return Ok(active.state().await);
            }
        }

        {
            let mut slots = self.slots.lock().await;
            if let Some(previous) = slots.installing.replace(Arc::clone(&worker)) {
                previous.mark_redundant().await;
            }
        }

        let installed = worker.dispatch(WorkerEvent::Install).await;

        {
            let mut slots = self.slots.lock().await;
            if slots
                .installing
                .as_ref()
                .is_some_and(|w| Arc::ptr_eq(w, &worker))
            {
                slots.installing = None;
            }
            installed?;
            if let Some(previous) = slots.waiting.replace(Arc::clone(&worker)) {
                info!(version = previous.version(), "Waiting version replaced");
                previous.mark_redundant().await;
            }
        }

        self.try_activate().await?;
        Ok(worker.state().await)
    }

    /// Activate the waiting worker if it asked to skip waiting or no client
    /// is still controlled by the active version. Returns whether it did.
    pub async fn try_activate(&self) -> Result<bool, WorkerError> {
        let mut slots = self.slots.lock().await;
        let Some(waiting) = slots.waiting.clone() else {
            return Ok(false);
        };

        if !waiting.skip_waiting_requested() {
            if let Some(active) = &slots.active {
                let remaining = self.clients.controlled_by(active.version()).await;
                if remaining > 0 {
                    debug!(
                        waiting = waiting.version(),
                        active = active.version(),
                        remaining,
                        "Waiting for clients of the active version to close"
                    );
                    return Ok(false);
                }
            }
        }

        // Fetches queue behind the slot lock until activation settles
        waiting.dispatch(WorkerEvent::Activate).await?;

        slots.waiting = None;
        if let Some(previous) = slots.active.replace(Arc::clone(&waiting)) {
            previous.mark_redundant().await;
        }
        drop(slots);

        let state = RegistrationState {
            active_version: Some(waiting.version().to_string()),
            activated_at: Some(Utc::now()),
        };
        if let Err(e) = state.save(self.storage.root()) {
            warn!(error = %e, "Failed to persist registration state");
        }
        Ok(true)
    }

    /// Track a newly opened client. It is controlled by the active version, if any.
    pub async fn open_client(&self, url: Url) -> ClientId {
        let controller = self.active().await.map(|w| w.version().to_string());
        self.clients.open(url, controller).await
    }

    /// Forget a client and activate a waiting version if that was the last
    /// client holding it back.
    pub async fn close_client(&self, id: ClientId) -> Result<bool, WorkerError> {
        if !self.clients.close(id).await {
            return Ok(false);
        }
        self.try_activate().await?;
        Ok(true)
    }

    /// Deliver a control message to the newest worker.
    pub async fn post_message(&self, message: Value) -> Result<Option<ControlMessage>, WorkerError> {
        let target = {
            let slots = self.slots.lock().await;
            slots
                .waiting
                .clone()
                .or_else(|| slots.installing.clone())
                .or_else(|| slots.active.clone())
        };
        let Some(target) = target else {
            debug!("No worker to receive message");
            return Ok(None);
        };

        let recognized = match target.dispatch(WorkerEvent::Message(message)).await? {
            EventOutcome::Message(recognized) => recognized,
            _ => None,
        };
        if recognized == Some(ControlMessage::SkipWaiting) {
            self.try_activate().await?;
        }
        Ok(recognized)
    }

    /// Route a request through the active worker, or straight to the network
    /// when nothing is active or the request is not intercepted.
    pub async fn fetch(&self, request: Request) -> Result<(Response, ResponseSource), WorkerError> {
        let Some(active) = self.active().await else {
            let response = self.network.fetch(&request).await?;
            return Ok((response, ResponseSource::Passthrough));
        };

        match active.dispatch(WorkerEvent::Fetch(request.clone())).await? {
            EventOutcome::Fetch(FetchResult::Respond { response, source }) => Ok((response, source)),
            _ => {
                let response = self.network.fetch(&request).await?;
                Ok((response, ResponseSource::Passthrough))
            }
        }
    }

    /// Wait for background cache writes of every tracked worker.
    pub async fn settle(&self) {
        let workers: Vec<_> = {
            let slots = self.slots.lock().await;
            [&slots.installing, &slots.waiting, &slots.active]
                .into_iter()
                .flatten()
                .cloned()
                .collect()
        };
        for worker in workers {
            worker.settle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::worker::testing::MockNetwork;

    const ORIGIN: &str = "https://tiles.test/";

    fn serve_manifest(network: &MockNetwork) {
        for path in ["", "index.html", "manifest.json", "icon-192.png", "icon-512.png"] {
            network.serve(&format!("{}{}", ORIGIN, path), 200, path);
        }
    }

    fn config(version: &str, skip_waiting_on_install: bool) -> WorkerConfig {
        let mut config = WorkerConfig::new(version, Url::parse(ORIGIN).unwrap());
        config.skip_waiting_on_install = skip_waiting_on_install;
        config
    }

    fn registration(dir: &Path, network: &Arc<MockNetwork>) -> Registration {
        Registration::new(CacheStorage::new(dir), network.clone())
    }

    #[tokio::test]
    async fn test_first_version_activates_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        let w = reg.worker(config("v1", false)).unwrap();
        assert_eq!(reg.register(w).await.unwrap(), VersionState::Activated);
        assert_eq!(reg.active().await.unwrap().version(), "v1");

        let state = RegistrationState::load(dir.path()).unwrap();
        assert_eq!(state.active_version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_new_version_waits_for_old_clients() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        let v1 = reg.worker(config("v1", false)).unwrap();
        reg.register(Arc::clone(&v1)).await.unwrap();
        let client = reg.open_client(Url::parse(ORIGIN).unwrap()).await;

        let v2 = reg.worker(config("v2", false)).unwrap();
        assert_eq!(reg.register(Arc::clone(&v2)).await.unwrap(), VersionState::Installed);
        assert_eq!(reg.active().await.unwrap().version(), "v1");
        assert!(reg.storage().has("v1").await.unwrap());

        assert!(reg.close_client(client).await.unwrap());
        assert_eq!(v2.state().await, VersionState::Activated);
        assert_eq!(v1.state().await, VersionState::Redundant);
        assert!(!reg.storage().has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_forced_ready_on_install_skips_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        reg.register(reg.worker(config("v1", true)).unwrap()).await.unwrap();
        let client = reg.open_client(Url::parse(ORIGIN).unwrap()).await;

        let v2 = reg.worker(config("v2", true)).unwrap();
        assert_eq!(reg.register(v2).await.unwrap(), VersionState::Activated);
        assert_eq!(
            reg.clients().get(client).await.unwrap().controller.as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_failed_activation_stays_waiting_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        let v1 = reg.worker(config("v1", true)).unwrap();
        reg.register(Arc::clone(&v1)).await.unwrap();
        let client = reg.open_client(Url::parse(ORIGIN).unwrap()).await;
        reg.storage().open("legacy").await.unwrap();
        reg.storage().set_undeletable("legacy", true);

        let v2 = reg.worker(config("v2", true)).unwrap();
        let err = reg.register(Arc::clone(&v2)).await.unwrap_err();
        assert!(matches!(err, WorkerError::StaleStoreDeletion { .. }));
        assert_eq!(v2.state().await, VersionState::Installed);
        assert_eq!(reg.waiting().await.unwrap().version(), "v2");
        assert_eq!(reg.active().await.unwrap().version(), "v1");
        assert_eq!(reg.clients().controlled_by("v1").await, 1);

        reg.storage().set_undeletable("legacy", false);
        assert!(reg.try_activate().await.unwrap());
        assert_eq!(v2.state().await, VersionState::Activated);
        assert_eq!(v1.state().await, VersionState::Redundant);
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["v2"]);
        assert_eq!(
            reg.clients().get(client).await.unwrap().controller.as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_new_version_without_open_clients_never_waits() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        reg.register(reg.worker(config("v1", false)).unwrap()).await.unwrap();
        let v2 = reg.worker(config("v2", false)).unwrap();
        assert_eq!(reg.register(Arc::clone(&v2)).await.unwrap(), VersionState::Activated);
        assert!(reg.waiting().await.is_none());

        // Nothing is waiting, so the message lands on the active version
        let recognized = reg.post_message(json!({"type": "SKIP_WAITING"})).await.unwrap();
        assert_eq!(recognized, Some(ControlMessage::SkipWaiting));
        assert_eq!(reg.active().await.unwrap().version(), "v2");
    }

    #[tokio::test]
    async fn test_unrecognized_message_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        let reg = registration(dir.path(), &network);

        reg.register(reg.worker(config("v1", false)).unwrap()).await.unwrap();
        reg.open_client(Url::parse(ORIGIN).unwrap()).await;
        let v2 = reg.worker(config("v2", false)).unwrap();
        reg.register(Arc::clone(&v2)).await.unwrap();

        let recognized = reg.post_message(json!({"type": "RELOAD"})).await.unwrap();
        assert_eq!(recognized, None);
        assert_eq!(v2.state().await, VersionState::Installed);
    }

    #[tokio::test]
    async fn test_failed_install_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        network.set_offline(true);
        let reg = registration(dir.path(), &network);

        let first = reg.worker(config("v1", true)).unwrap();
        assert!(reg.register(Arc::clone(&first)).await.is_err());
        assert_eq!(first.state().await, VersionState::Redundant);
        assert!(reg.active().await.is_none());
        assert!(reg.installing().await.is_none());

        network.set_offline(false);
        let retry = reg.worker(config("v1", true)).unwrap();
        assert_eq!(reg.register(retry).await.unwrap(), VersionState::Activated);
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        network.serve("https://tiles.test/app.js", 200, "js");
        let reg = registration(dir.path(), &network);

        let request = Request::get(Url::parse("https://tiles.test/app.js").unwrap());
        let (response, source) = reg.fetch(request).await.unwrap();
        assert_eq!(source, ResponseSource::Passthrough);
        assert_eq!(&response.body[..], b"js");
        assert!(reg.storage().keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_resumes_persisted_version() {
        let dir = tempfile::tempdir().unwrap();
        let network = MockNetwork::new();
        serve_manifest(&network);
        {
            let reg = registration(dir.path(), &network);
            reg.register(reg.worker(config("v1", true)).unwrap()).await.unwrap();
        }

        let reg = registration(dir.path(), &network);
        let calls_before = network.calls();
        assert!(reg.restore(reg.worker(config("v1", true)).unwrap()).await.unwrap());
        assert_eq!(network.calls(), calls_before);
        assert_eq!(reg.active().await.unwrap().state().await, VersionState::Activated);

        // A different configured version is not resumed
        let other = registration(dir.path(), &network);
        assert!(!other.restore(other.worker(config("v2", true)).unwrap()).await.unwrap());
    }
}
