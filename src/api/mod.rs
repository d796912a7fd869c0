//! HTTP surface
//!
//! Routes inbound requests to the proxy core and serves the informational
//! endpoints.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{AppState, BareServer};
