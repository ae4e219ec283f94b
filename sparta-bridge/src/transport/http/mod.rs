//! HTTP invocation surface.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
