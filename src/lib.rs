//! Bare Proxy - content-rewriting reverse proxy
//!
//! Serves arbitrary third-party sites through a single origin so they can be
//! embedded in iframes.
//!
//! ## Features
//!
//! - HTTP forwarding with header sanitization and CORS
//! - HTML, CSS and JavaScript rewriting so subresources route back through the proxy
//! - WebSocket tunnelling
//! - Per-client fixed window rate limiting
//! - Optional egress through rotating HTTP/SOCKS proxies

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod rewrite;
pub mod services;

pub use config::Config;
pub use error::{BareError, Result};
