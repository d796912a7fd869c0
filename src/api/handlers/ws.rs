//! WebSocket proxy endpoint

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::response::Response;
use tracing::{instrument, warn};

use crate::api::server::AppState;
use crate::error::BareError;
use crate::proxy::{client_identity, is_websocket_upgrade, parse_ws_target};

use super::target_param;

/// Tunnel `?url=<ws(s)-url>` after a successful upstream handshake
#[instrument(skip(state, request), fields(client = %peer))]
pub async fn websocket(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return BareError::InvalidRequest("expected a WebSocket upgrade request".into())
            .to_response(None);
    }

    let Some(raw) = target_param(request.uri()) else {
        return BareError::InvalidTarget("missing url parameter".into()).to_response(None);
    };
    let target = match parse_ws_target(&raw) {
        Ok(target) => target,
        Err(e) => return e.to_response(Some(&raw)),
    };

    let identity = client_identity(
        peer,
        request.headers(),
        state.config.rate_limit.trust_forwarded,
    );
    if let Err(e) = state.rate_limiter.check(&identity) {
        return e.to_response(Some(target.as_str()));
    }

    let client_upgrade = hyper::upgrade::on(&mut request);
    match state
        .tunnel
        .open(target.clone(), request.headers(), client_upgrade)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(target_url = %target, kind = e.kind(), "WebSocket tunnel failed: {}", e);
            e.to_response(Some(target.as_str()))
        }
    }
}
