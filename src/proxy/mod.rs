//! Proxy core
//!
//! This module provides the forwarding machinery behind the HTTP surface:
//! - Upstream transport (direct, HTTP CONNECT or SOCKS5 egress, TLS)
//! - Egress rotation with failure tracking
//! - Header sanitization in both directions
//! - Request forwarding with optional body rewriting
//! - WebSocket tunneling
//! - Per-client rate limiting

pub mod egress;
pub mod handler;
pub mod headers;
pub mod middleware;
pub mod rotation;
pub mod transport;
pub mod tunnel;

pub use handler::{parse_http_target, Forwarder, ForwarderConfig, ProxyRequest};
pub use headers::HeaderSanitizer;
pub use middleware::{client_identity, RateLimitStatus, RateLimiter};
pub use rotation::EgressPool;
pub use transport::{UpstreamConnector, UpstreamTarget};
pub use tunnel::{is_websocket_upgrade, parse_ws_target, TunnelState, WebSocketTunnel};
