//! Invocation transports.
//!
//! Currently an HTTP surface via axum.

pub mod http;

pub use http::{ServerConfig, serve};
