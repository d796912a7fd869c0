//! Server information endpoint

use axum::extract::State;
use axum::Json;

use crate::api::server::AppState;
use crate::models::{EgressInfo, EndpointInfo, RateLimitInfo, ServerInfo};

use super::health::SERVER_NAME;

/// Identity, capabilities and limits of this proxy
pub async fn server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    let prefix = &state.config.server.prefix;
    let limiter = &state.rate_limiter;

    let mut features = vec![
        "http-proxy",
        "websocket-proxy",
        "header-sanitization",
        "compression",
        "egress-rotation",
    ];
    if state.config.rewrite.enabled {
        features.push("content-rewriting");
    }
    if limiter.is_enabled() {
        features.push("rate-limiting");
    }

    Json(ServerInfo {
        server: SERVER_NAME,
        version: env!("CARGO_PKG_VERSION"),
        language: "rust",
        uptime: state.uptime().as_secs(),
        endpoints: EndpointInfo {
            proxy: format!("{}/proxy", prefix),
            websocket: format!("{}/ws", prefix),
            info: format!("{}/info", prefix),
        },
        features,
        rate_limit: RateLimitInfo {
            enabled: limiter.is_enabled(),
            window_secs: limiter.window().as_secs(),
            max_requests: limiter.limit(),
            tracked_clients: limiter.client_count(),
        },
        egress: EgressInfo {
            configured: state.egress_pool.len(),
            available: state.egress_pool.available_count(),
        },
    })
}
