use thiserror::Error;

use crate::cache::StoreError;
use crate::network::NetworkError;

use super::VersionState;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Precache failed for version {version}: {source}")]
    Precache {
        version: String,
        #[source]
        source: StoreError,
    },

    #[error("Navigation to {url} failed and no shell is cached: {source}")]
    NavigationMiss {
        url: String,
        #[source]
        source: NetworkError,
    },

    #[error("Asset {url} is not cached and the network failed: {source}")]
    AssetMiss {
        url: String,
        #[source]
        source: NetworkError,
    },

    #[error("Failed to delete stale cache store {name}: {source}")]
    StaleStoreDeletion {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Worker {version} cannot {action} while {state}")]
    InvalidState {
        version: String,
        action: &'static str,
        state: VersionState,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}
