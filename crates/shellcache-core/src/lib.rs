//! Core library for shellcache.
//!
//! shellcache sits between a client application and the network. Every
//! outgoing request is classified and resolved from a versioned, persistent
//! cache where appropriate, and successive deployed versions hand over to one
//! another without breaking sessions that are already open.
//!
//! - `cache`: named persistent stores, one per deployed version
//! - `models`: request/response boundary types and request classification
//! - `network`: the `Network` trait and its reqwest-backed implementation
//! - `worker`: install, fetch, activate, and control-message handling
//! - `registration`: host-side coordination of installing/waiting/active versions

pub mod cache;
pub mod config;
pub mod models;
pub mod network;
pub mod registration;
pub mod worker;

pub use cache::{CacheStorage, CacheStore, CachedResponse, StoreError};
pub use config::{Config, WorkerConfig};
pub use models::{Method, Request, RequestClass, RequestMode, Response};
pub use network::{HttpNetwork, Network, NetworkError};
pub use registration::{Registration, RegistrationState};
pub use worker::{
    ActivateReport, ClientId, ClientInfo, Clients, ControlMessage, EventOutcome, FetchResult,
    PendingToken, ResponseSource, VersionState, Worker, WorkerError, WorkerEvent,
};
