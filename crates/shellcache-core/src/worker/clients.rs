//! Open client sessions and which version controls each of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An open application session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub url: Url,
    /// Version currently serving this client's requests, if any.
    pub controller: Option<String>,
}

/// Shared registry of open clients. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    inner: Arc<RwLock<HashMap<ClientId, ClientInfo>>>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, url: Url, controller: Option<String>) -> ClientId {
        let id = ClientId::next();
        debug!(client = %id, %url, ?controller, "Client opened");
        self.inner.write().await.insert(
            id,
            ClientInfo {
                id,
                url,
                controller,
            },
        );
        id
    }

    pub async fn close(&self, id: ClientId) -> bool {
        self.inner.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<ClientInfo> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Make `version` the controller of every open client. Returns how many
    /// clients changed hands.
    pub async fn claim(&self, version: &str) -> usize {
        let mut clients = self.inner.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    pub async fn controlled_by(&self, version: &str) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.controller.as_deref() == Some(version))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every open client, ordered by id.
    pub async fn list(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<_> = self.inner.read().await.values().cloned().collect();
        clients.sort_by_key(|c| c.id);
        clients
    }
}
