//! Boundary types exchanged with the host application.
//!
//! - `Request`, `Method`, `RequestMode`: what the application asks for
//! - `RequestClass`: how the interceptor treats a request
//! - `Response`: status, headers, and a fully buffered body

pub mod request;
pub mod response;

pub use request::{Method, Request, RequestClass, RequestMode};
pub use response::Response;
