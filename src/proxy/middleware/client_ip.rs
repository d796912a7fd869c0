//! Client identity used as the rate-limit key

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Derive the identity a request is rate limited under
///
/// The peer address is authoritative. Forwarding headers are only consulted
/// when the proxy runs behind a trusted load balancer, since clients can set
/// them freely otherwise.
pub fn client_identity(peer: SocketAddr, headers: &HeaderMap, trust_forwarded: bool) -> String {
    if trust_forwarded {
        if let Some(ip) = forwarded_ip(headers) {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    from_xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}
