//! Persistent, versioned cache storage.
//!
//! A `CacheStorage` is a directory holding one `CacheStore` per deployed
//! version name. Stores are the unit of garbage collection: superseded
//! generations are deleted whole, never pruned entry by entry.
//!
//! Each entry lives in a single file (a JSON metadata line followed by the
//! raw body) named after the SHA-256 of its key. Writes go to a temporary
//! file and are renamed into place, so a reader sees either the old entry or
//! the new one.

pub mod error;
pub mod storage;
pub mod store;

pub use error::StoreError;
pub use storage::CacheStorage;
pub use store::{CacheStore, CachedResponse};
