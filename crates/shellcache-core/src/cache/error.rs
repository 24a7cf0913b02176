use thiserror::Error;

use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),

    #[error("Refusing to cache partial content for {0}")]
    PartialContent(String),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: NetworkError,
    },

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },
}
