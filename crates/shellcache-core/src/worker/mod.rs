//! One deployed version of the caching worker.
//!
//! A `Worker` owns nothing persistent itself: it reads and writes the cache
//! store named after its configured version, fetches through the shared
//! `Network`, and claims clients through the shared `Clients` registry.
//!
//! Lifecycle (per instance):
//!
//! ```text
//! Parsed -> Installing -> Installed (waiting) -> Activating -> Activated -> Redundant
//!               |                                                ^
//!               +---------------- precache failed ---------------+
//! ```
//!
//! Every event dispatched to a worker holds a `PendingToken` until all of its
//! nested asynchronous steps have settled. Background cache writes started by
//! fetch handling hold one too, so `pending() == 0` means the host may safely
//! shut the worker down.

pub mod clients;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod message;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Origin;

use crate::cache::{CacheStorage, CacheStore};
use crate::config::WorkerConfig;
use crate::models::Request;
use crate::network::Network;

pub use clients::{ClientId, ClientInfo, Clients};
pub use error::WorkerError;
pub use fetch::{FetchResult, ResponseSource};
pub use lifecycle::ActivateReport;
pub use message::ControlMessage;

/// Lifecycle state of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    Parsed,
    Installing,
    /// Installed and waiting to activate.
    Installed,
    Activating,
    Activated,
    /// Failed to install, or superseded by a newer version.
    Redundant,
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionState::Parsed => "parsed",
            VersionState::Installing => "installing",
            VersionState::Installed => "installed",
            VersionState::Activating => "activating",
            VersionState::Activated => "activated",
            VersionState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Events the host delivers to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(Value),
}

impl WorkerEvent {
    fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
        }
    }
}

/// Result of a dispatched event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed,
    Activated(ActivateReport),
    Fetch(FetchResult),
    Message(Option<ControlMessage>),
}

/// Keeps a worker marked busy until dropped.
#[derive(Debug)]
pub struct PendingToken {
    counter: Arc<AtomicUsize>,
}

impl PendingToken {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for PendingToken {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Worker {
    config: WorkerConfig,
    origin: Origin,
    storage: CacheStorage,
    network: Arc<dyn Network>,
    clients: Clients,
    state: Arc<Mutex<VersionState>>,
    skip_waiting: AtomicBool,
    pending: Arc<AtomicUsize>,
    background: Mutex<JoinSet<()>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("version", &self.config.version)
            .field("origin", &self.config.origin.as_str())
            .field("skip_waiting", &self.skip_waiting.load(Ordering::SeqCst))
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        storage: CacheStorage,
        network: Arc<dyn Network>,
        clients: Clients,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let origin = config.origin.origin();
        Ok(Self {
            config,
            origin,
            storage,
            network,
            clients,
            state: Arc::new(Mutex::new(VersionState::Parsed)),
            skip_waiting: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            background: Mutex::new(JoinSet::new()),
        })
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub async fn state(&self) -> VersionState {
        *self.state.lock().await
    }

    /// Number of events and background writes still in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Whether this version has asked not to wait for older clients.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Ask to activate without waiting for clients of the previous version.
    /// Returns false if it had already been requested.
    pub fn skip_waiting(&self) -> bool {
        let first = !self.skip_waiting.swap(true, Ordering::SeqCst);
        if first {
            info!(version = %self.config.version, "Skip waiting requested");
        }
        first
    }

    /// Deliver one event, holding a pending token until it has fully settled.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
        let _token = PendingToken::new(&self.pending);
        debug!(version = %self.config.version, event = event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Install => self.install().await.map(|()| EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => self.handle_fetch(&request).await.map(EventOutcome::Fetch),
            WorkerEvent::Message(value) => Ok(EventOutcome::Message(self.handle_message(&value))),
        }
    }

    /// React to a control message. Unrecognized messages are ignored.
    pub fn handle_message(&self, value: &Value) -> Option<ControlMessage> {
        match ControlMessage::parse(value) {
            Some(ControlMessage::SkipWaiting) => {
                self.skip_waiting();
                Some(ControlMessage::SkipWaiting)
            }
            None => {
                debug!(version = %self.config.version, "Ignoring unrecognized message");
                None
            }
        }
    }

    /// Wait for every background cache write started so far, including
    /// writes started while waiting.
    pub async fn settle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.background.lock().await);
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!(version = %self.config.version, error = %e, "Background cache task failed");
                }
            }
        }
    }

    /// Mark this instance superseded. Terminal.
    pub async fn mark_redundant(&self) {
        let mut state = self.state.lock().await;
        if *state != VersionState::Redundant {
            info!(version = %self.config.version, from = %*state, "Worker is redundant");
            *state = VersionState::Redundant;
        }
    }

    /// Open this version's store, creating it. Install only.
    async fn store(&self) -> Result<CacheStore, WorkerError> {
        Ok(self.storage.open(&self.config.version).await?)
    }

    /// Move from one of `from` to `to`, or fail without changing state.
    async fn transition(
        &self,
        from: &[VersionState],
        to: VersionState,
        action: &'static str,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        if !from.contains(&*state) {
            return Err(WorkerError::InvalidState {
                version: self.config.version.clone(),
                action,
                state: *state,
            });
        }
        debug!(version = %self.config.version, from = %*state, to = %to, "State transition");
        *state = to;
        Ok(())
    }

    /// Run `task` detached from the caller's response, keeping the worker
    /// marked busy until it finishes.
    async fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = PendingToken::new(&self.pending);
        let mut tasks = self.background.lock().await;
        // Reap finished writes so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            task.await;
            drop(token);
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory network double shared by the worker and registration tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::models::{Request, Response};
    use crate::network::{Network, NetworkError};

    #[derive(Default)]
    pub struct MockNetwork {
        responses: Mutex<HashMap<String, (u16, String)>>,
        offline: Mutex<HashSet<String>>,
        all_offline: std::sync::atomic::AtomicBool,
        gate: Mutex<Option<Arc<Notify>>>,
        calls: AtomicUsize,
    }

    impl MockNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn serve(&self, url: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, body.to_string()));
        }

        pub fn fail(&self, url: &str) {
            self.offline.lock().unwrap().insert(url.to_string());
        }

        pub fn set_offline(&self, offline: bool) {
            self.all_offline.store(offline, Ordering::SeqCst);
        }

        /// Hold every fetch until the returned `Notify` is signalled.
        pub fn hold(&self) -> Arc<Notify> {
            let notify = Arc::new(Notify::new());
            *self.gate.lock().unwrap() = Some(Arc::clone(&notify));
            notify
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Network for MockNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let url = request.url.as_str();
            if self.all_offline.load(Ordering::SeqCst) || self.offline.lock().unwrap().contains(url)
            {
                return Err(NetworkError::Unreachable(url.to_string()));
            }
            match self.responses.lock().unwrap().get(url) {
                Some((status, body)) => Ok(Response::new(*status, vec![], body.clone())),
                None => Ok(Response::new(404, vec![], "not found")),
            }
        }
    }
}
