//! Network backend used by the worker.
//!
//! The worker never talks to reqwest directly; it goes through the `Network`
//! trait so tests can substitute an in-memory double. `HttpNetwork` is the
//! production implementation.
//!
//! A response with any HTTP status counts as a successful fetch. Only
//! transport failures (DNS, refused connection, timeout, truncated body)
//! surface as `NetworkError`.

pub mod client;
pub mod error;

pub use client::{HttpNetwork, Network};
pub use error::NetworkError;
