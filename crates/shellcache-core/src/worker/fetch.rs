//! Fetch interception.
//!
//! Navigations are network-first: a successful response is returned at once
//! and copied under the shell key in the background; on network failure the
//! shell (then the root path) is served from cache.
//!
//! Assets are stale-while-revalidate: a cached copy is returned immediately
//! while a background fetch refreshes it; on a miss the network response is
//! returned and copied into the store in the background.
//!
//! Any response the network resolves with counts as a success, whatever its
//! status, and is written back. Only transport failures fall back to cache.
//!
//! Background writes never influence the response already handed back. Their
//! failures are logged and dropped, and they never recreate a store that a
//! newer version has deleted.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, CachedResponse};
use crate::models::{Request, RequestClass, Response};
use crate::network::Network;

use super::{VersionState, Worker, WorkerError};

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Navigation served from the shell key after a network failure.
    Shell,
    /// Navigation served from the root path after a network failure.
    RootFallback,
    /// Not intercepted; plain network handling.
    Passthrough,
}

#[derive(Debug)]
pub enum FetchResult {
    /// Not intercepted. The host performs the request itself.
    Passthrough,
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl Worker {
    /// Resolve one intercepted request. Only an activated worker serves fetches.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchResult, WorkerError> {
        let state = self.state().await;
        if state != VersionState::Activated {
            return Err(WorkerError::InvalidState {
                version: self.config.version.clone(),
                action: "handle fetch",
                state,
            });
        }

        match request.classify(&self.origin) {
            RequestClass::Ignored => {
                debug!(method = %request.method, url = %request.url, "Passing request through");
                Ok(FetchResult::Passthrough)
            }
            RequestClass::Navigation => self.handle_navigation(request).await,
            RequestClass::Asset => self.handle_asset(request).await,
        }
    }

    async fn handle_navigation(&self, request: &Request) -> Result<FetchResult, WorkerError> {
        let shell_key = self.config.resolve(&self.config.shell_key)?.to_string();

        match self.network.fetch(request).await {
            Ok(response) => {
                self.persist(shell_key, response.duplicate()).await;
                Ok(FetchResult::Respond {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(source) => {
                debug!(url = %request.url, error = %source, "Navigation offline, trying shell");
                if let Some(hit) = self.lookup(&shell_key).await {
                    return Ok(respond_cached(hit, ResponseSource::Shell));
                }
                let fallback_key = self.config.resolve(&self.config.fallback_key)?.to_string();
                if let Some(hit) = self.lookup(&fallback_key).await {
                    return Ok(respond_cached(hit, ResponseSource::RootFallback));
                }
                Err(WorkerError::NavigationMiss {
                    url: request.url.to_string(),
                    source,
                })
            }
        }
    }

    async fn handle_asset(&self, request: &Request) -> Result<FetchResult, WorkerError> {
        let key = request.cache_key();

        if let Some(hit) = self.lookup(&key).await {
            self.revalidate(request.clone(), key).await;
            return Ok(respond_cached(hit, ResponseSource::Cache));
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.persist(key, response.duplicate()).await;
                Ok(FetchResult::Respond {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(source) => Err(WorkerError::AssetMiss {
                url: request.url.to_string(),
                source,
            }),
        }
    }

    /// Cache read that degrades to a miss on storage errors.
    async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let result = match self.storage.get(&self.config.version).await {
            Ok(Some(store)) => store.match_key(key).await,
            Ok(None) => {
                debug!(version = %self.config.version, key, "Cache store is gone, treating as miss");
                return None;
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(hit) => hit,
            Err(e) => {
                warn!(version = %self.config.version, key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Best-effort background write of `response` under `key`.
    async fn persist(&self, key: String, response: Response) {
        let target = self.write_target();
        self.spawn_background(async move {
            target.write(&key, &response).await;
        })
        .await;
    }

    /// Background refresh of a cached asset.
    async fn revalidate(&self, request: Request, key: String) {
        let target = self.write_target();
        let network = Arc::clone(&self.network);
        self.spawn_background(async move {
            match network.fetch(&request).await {
                Ok(response) => target.write(&key, &response).await,
                Err(e) => {
                    debug!(key = %key, error = %e, "Revalidation failed, keeping cached copy");
                }
            }
        })
        .await;
    }

    fn write_target(&self) -> WriteTarget {
        WriteTarget {
            storage: self.storage.clone(),
            version: self.config.version.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Where a background write lands. Outlives the fetch that started it.
struct WriteTarget {
    storage: CacheStorage,
    version: String,
    state: Arc<Mutex<VersionState>>,
}

impl WriteTarget {
    /// Best-effort write. Never creates the store: once a newer version has
    /// deleted it, late writes from this version are dropped.
    async fn write(&self, key: &str, response: &Response) {
        let version = self.version.as_str();
        let state = *self.state.lock().await;
        if state != VersionState::Activated {
            debug!(store = version, key, state = %state, "Worker no longer active, cache write dropped");
            return;
        }
        let result = match self.storage.get(version).await {
            Ok(Some(store)) => store.put(key, response).await,
            Ok(None) => {
                debug!(store = version, key, "Cache store is gone, cache write dropped");
                return;
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(store = version, key, "Cache updated"),
            Err(e) => debug!(store = version, key, error = %e, "Cache write dropped"),
        }
    }
}

fn respond_cached(hit: CachedResponse, source: ResponseSource) -> FetchResult {
    FetchResult::Respond {
        response: hit.into_response(),
        source,
    }
}
