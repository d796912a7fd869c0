//! HTTP proxy endpoint

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{instrument, warn};

use crate::api::server::AppState;
use crate::error::BareError;
use crate::proxy::{client_identity, parse_http_target, ProxyRequest};

use super::target_param;

/// Forward `?url=<absolute-url>` upstream
///
/// The target is validated before admission so malformed requests never
/// consume rate limit budget.
#[instrument(skip(state, request), fields(method = %request.method(), client = %peer))]
pub async fn proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    if request.method() == Method::OPTIONS {
        let headers = state.forwarder.sanitizer().preflight_headers(request.headers());
        return (StatusCode::NO_CONTENT, headers).into_response();
    }

    let Some(raw) = target_param(request.uri()) else {
        return BareError::InvalidTarget("missing url parameter".into()).to_response(None);
    };
    let target = match parse_http_target(&raw) {
        Ok(target) => target,
        Err(e) => return e.to_response(Some(&raw)),
    };

    let identity = client_identity(
        peer,
        request.headers(),
        state.config.rate_limit.trust_forwarded,
    );
    let admitted = match state.rate_limiter.check(&identity) {
        Ok(status) => status,
        Err(e) => return e.to_response(Some(target.as_str())),
    };

    let (parts, body) = request.into_parts();
    let body = match parts.method {
        Method::GET | Method::HEAD => None,
        _ => Some(body),
    };

    let result = state
        .forwarder
        .forward(ProxyRequest {
            target: target.clone(),
            method: parts.method,
            headers: parts.headers,
            body,
        })
        .await;

    match result {
        Ok(mut response) => {
            if let Some(status) = admitted {
                status.apply_headers(response.headers_mut());
            }
            response
        }
        Err(e) => {
            warn!(target_url = %target, kind = e.kind(), "Proxy request failed: {}", e);
            e.to_response(Some(target.as_str()))
        }
    }
}
