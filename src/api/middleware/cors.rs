//! CORS middleware configuration
//!
//! The informational routes are meant to be read from any page that embeds
//! the proxy, so every origin is allowed. The proxy route sets its own CORS
//! headers from the header sanitizer.

use std::time::Duration;

use axum::http::Method;
use tower_http::cors::{Any, CorsLayer};

/// Preflight cache lifetime
const MAX_AGE: Duration = Duration::from_secs(86400);

/// Permissive CORS for the info and health routes
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(MAX_AGE)
}
