//! Request logging middleware

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::api::handlers::target_param;

/// Request logging middleware
pub struct RequestLogging;

impl RequestLogging {
    /// Log request details
    ///
    /// Only the path and the target host are logged; full target URLs can
    /// carry credentials or tokens in their query strings.
    pub async fn log_request(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let target_host = target_param(req.uri())
            .and_then(|raw| Url::parse(&raw).ok())
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "-".to_string());
        let start = Instant::now();

        debug!("{} {} -> {} - started", method, path, target_host);

        let response = next.run(req).await;

        let duration = start.elapsed();
        let status = response.status();

        info!(
            "{} {} -> {} - {} in {:?}",
            method, path, target_host, status, duration
        );

        response
    }
}
