//! WebSocket tunnel
//!
//! Performs the upstream upgrade handshake on the client's behalf, answers
//! the client with the matching `101`, then relays raw bytes between the two
//! upgraded connections. Frames are never inspected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use url::{Position, Url};

use crate::error::{BareError, ConnectFailureKind, Result};
use crate::proxy::headers::HeaderSanitizer;
use crate::proxy::transport::UpstreamConnector;

/// Lifecycle of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingUpgrade,
    Connecting,
    ProxyingBidirectional,
    Closed,
}

impl TunnelState {
    fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (AwaitingUpgrade, Connecting)
                | (Connecting, ProxyingBidirectional)
                | (AwaitingUpgrade | Connecting | ProxyingBidirectional, Closed)
        )
    }
}

/// Tracks a tunnel through its states
#[derive(Debug)]
pub struct TunnelSession {
    target: Url,
    state: TunnelState,
    opened_at: Instant,
}

impl TunnelSession {
    pub fn new(target: Url) -> Self {
        Self {
            target,
            state: TunnelState::AwaitingUpgrade,
            opened_at: Instant::now(),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, next: TunnelState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(BareError::Internal(format!(
                "invalid tunnel transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!(target_url = %self.target, from = ?self.state, to = ?next, "Tunnel state change");
        self.state = next;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state != TunnelState::Closed {
            self.state = TunnelState::Closed;
            debug!(
                target_url = %self.target,
                lifetime = ?self.opened_at.elapsed(),
                "Tunnel closed"
            );
        }
    }
}

/// Which peer ended the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
}

/// Result of a finished splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub closed_by: ClosedBy,
    /// Bytes relayed in the direction that finished first
    pub bytes: u64,
}

/// Whether the request asks for a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket
}

/// Parse the `url` query value of a WebSocket request
///
/// `http(s)` targets are accepted and mapped to `ws(s)`.
pub fn parse_ws_target(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| BareError::InvalidTarget(format!("{}: {}", raw, e)))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(BareError::InvalidTarget(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(BareError::InvalidTarget(format!("{}: cannot use {}", raw, scheme)));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(BareError::InvalidTarget(format!("{}: missing host", raw)));
    }
    Ok(url)
}

/// Opens WebSocket tunnels to upstream targets
pub struct WebSocketTunnel {
    connector: Arc<UpstreamConnector>,
    sanitizer: HeaderSanitizer,
    handshake_timeout: Duration,
}

impl WebSocketTunnel {
    pub fn new(
        connector: Arc<UpstreamConnector>,
        sanitizer: HeaderSanitizer,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            sanitizer,
            handshake_timeout,
        }
    }

    /// Complete the upstream handshake and return the client's `101`
    ///
    /// The relay itself runs on a spawned task once both sides have
    /// upgraded. Bytes either peer sent right after its handshake are kept
    /// by the upgraded connections and relayed first.
    #[instrument(skip(self, client_headers, client_upgrade), fields(target = %target))]
    pub async fn open(
        &self,
        target: Url,
        client_headers: &HeaderMap,
        client_upgrade: OnUpgrade,
    ) -> Result<Response<Body>> {
        let mut session = TunnelSession::new(target.clone());
        if !is_websocket_upgrade(client_headers) {
            session.close();
            return Err(BareError::InvalidRequest(
                "expected a WebSocket upgrade request".into(),
            ));
        }

        session.advance(TunnelState::Connecting)?;
        let result = tokio::time::timeout(
            self.handshake_timeout,
            self.handshake(&target, client_headers),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BareError::UpgradeFailed(format!(
                "upstream handshake timed out after {:?}",
                self.handshake_timeout
            )))
        })
        .map_err(|e| match e {
            BareError::UpstreamTimeout => {
                BareError::UpgradeFailed("upstream connect timed out".into())
            }
            other => other,
        });

        let mut upstream_response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "WebSocket upstream handshake failed");
                session.close();
                return Err(e);
            }
        };

        let mut client_response = Response::new(Body::empty());
        *client_response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = client_response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        for name in [
            header::SEC_WEBSOCKET_ACCEPT,
            header::SEC_WEBSOCKET_PROTOCOL,
            header::SEC_WEBSOCKET_EXTENSIONS,
        ] {
            if let Some(value) = upstream_response.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(target_url = %session.target(), error = %e, "WebSocket upgrade did not complete");
                    session.close();
                    return;
                }
            };

            if session.advance(TunnelState::ProxyingBidirectional).is_err() {
                return;
            }
            info!(target_url = %session.target(), "WebSocket tunnel established");

            let outcome = splice(TokioIo::new(client), TokioIo::new(upstream)).await;
            debug!(
                target_url = %session.target(),
                closed_by = ?outcome.closed_by,
                bytes = outcome.bytes,
                "WebSocket tunnel finished"
            );
            session.close();
        });

        Ok(client_response)
    }

    /// Send the upgrade request upstream and insist on a `101`
    async fn handshake(
        &self,
        target: &Url,
        client_headers: &HeaderMap,
    ) -> Result<Response<hyper::body::Incoming>> {
        let connection = self.connector.connect(target, false).await?;

        let mut headers = self.sanitizer.request_headers(client_headers, target, None);
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(&target[Position::BeforePath..Position::AfterQuery])
            .body(Body::empty())
            .map_err(|e| BareError::InvalidRequest(format!("Failed to build request: {}", e)))?;
        *request.headers_mut() = headers;

        let io = TokioIo::new(connection.stream);
        let egress = connection.egress;
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(handshake) => handshake,
            Err(e) => {
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(BareError::connect(ConnectFailureKind::Protocol, e.to_string()));
            }
        };

        let driver = tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream WebSocket connection ended: {}", e);
            }
        });

        let response = match sender.send_request(request).await {
            Ok(response) => {
                self.connector.report_outcome(egress.as_ref(), true);
                response
            }
            Err(e) => {
                driver.abort();
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(BareError::UpgradeFailed(format!("upstream request failed: {}", e)));
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(BareError::UpgradeFailed(format!(
                "upstream answered {}",
                response.status()
            )));
        }
        if !response.headers().contains_key(header::SEC_WEBSOCKET_ACCEPT) {
            return Err(BareError::UpgradeFailed(
                "upstream omitted Sec-WebSocket-Accept".into(),
            ));
        }

        Ok(response)
    }
}

/// Relay bytes both ways until either side closes or fails
///
/// When one direction finishes, the other is dropped and both connections
/// are closed.
pub async fn splice<C, U>(client: C, upstream: U) -> SpliceOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };

    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (closed_by, result) = tokio::select! {
        result = client_to_upstream => (ClosedBy::Client, result),
        result = upstream_to_client => (ClosedBy::Upstream, result),
    };

    let bytes = result.unwrap_or_else(|e| {
        debug!(closed_by = ?closed_by, "Tunnel copy ended with error: {}", e);
        0
    });

    SpliceOutcome { closed_by, bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EgressEndpoint, EgressProtocol, UserAgentMode};
    use crate::proxy::rotation::EgressPool;
    use crate::rewrite::test_support::PROXY;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers
    }

    fn tunnel() -> WebSocketTunnel {
        tunnel_with(Arc::new(EgressPool::empty()), Duration::from_secs(2))
    }

    fn tunnel_with(pool: Arc<EgressPool>, handshake_timeout: Duration) -> WebSocketTunnel {
        let connector = UpstreamConnector::new(pool, Duration::from_secs(2)).unwrap();
        WebSocketTunnel::new(
            Arc::new(connector),
            HeaderSanitizer::new(
                UserAgentMode::Rotate,
                PROXY,
                &Url::parse("http://localhost:3000").unwrap(),
            ),
            handshake_timeout,
        )
    }

    fn detached_upgrade() -> OnUpgrade {
        let mut request = Request::new(Body::empty());
        hyper::upgrade::on(&mut request)
    }

    #[test]
    fn test_state_transitions() {
        let mut session = TunnelSession::new(Url::parse("wss://example.com/").unwrap());
        assert_eq!(session.state(), TunnelState::AwaitingUpgrade);
        assert!(session.advance(TunnelState::ProxyingBidirectional).is_err());

        session.advance(TunnelState::Connecting).unwrap();
        session.advance(TunnelState::ProxyingBidirectional).unwrap();
        session.close();
        assert_eq!(session.state(), TunnelState::Closed);
        assert!(session.advance(TunnelState::Connecting).is_err());
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_websocket_upgrade(&upgrade_headers()));

        let mut headers = upgrade_headers();
        headers.remove(header::UPGRADE);
        assert!(!is_websocket_upgrade(&headers));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn test_parse_ws_target() {
        assert_eq!(parse_ws_target("wss://example.com/s").unwrap().as_str(), "wss://example.com/s");
        assert_eq!(parse_ws_target("https://example.com/s").unwrap().scheme(), "wss");
        assert_eq!(parse_ws_target("http://example.com:8080/").unwrap().as_str(), "ws://example.com:8080/");
        assert!(parse_ws_target("ftp://example.com/").is_err());
        assert!(parse_ws_target("nope").is_err());
    }

    #[tokio::test]
    async fn test_splice_relays_and_reports_closing_side() {
        let (client, mut browser) = tokio::io::duplex(1024);
        let (upstream, mut server) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move { splice(client, upstream).await });

        browser.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        browser.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(server);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice did not finish")
            .unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Upstream);
        assert_eq!(outcome.bytes, 4);

        // The client side is closed along with the upstream.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), browser.read_to_end(&mut rest))
            .await
            .expect("client side left open")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_client_close_ends_splice() {
        let (client, browser) = tokio::io::duplex(64);
        let (upstream, _server) = tokio::io::duplex(64);

        let handle = tokio::spawn(async move { splice(client, upstream).await });
        drop(browser);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice did not finish")
            .unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Client);
    }

    #[tokio::test]
    async fn test_non_upgrade_request_rejected() {
        let err = tunnel()
            .open(
                Url::parse("ws://127.0.0.1:9/").unwrap(),
                &HeaderMap::new(),
                detached_upgrade(),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_refusing_upgrade_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = tunnel()
            .open(
                Url::parse(&format!("ws://{}/socket", addr)).unwrap(),
                &upgrade_headers(),
                detached_upgrade(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BareError::UpgradeFailed(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = tunnel()
            .open(
                Url::parse(&format!("ws://{}/", addr)).unwrap(),
                &upgrade_headers(),
                detached_upgrade(),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_silent_upstream_handshake_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let err = tunnel_with(Arc::new(EgressPool::empty()), Duration::from_millis(200))
            .open(
                Url::parse(&format!("ws://{}/", addr)).unwrap(),
                &upgrade_headers(),
                detached_upgrade(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BareError::UpgradeFailed(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_egress_dropping_handshakes_is_excluded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let egress_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                // Accept the CONNECT, then hang up on the handshake.
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = socket.read(&mut buf).await;
                drop(socket);
            }
        });

        let pool = Arc::new(EgressPool::new(
            &[EgressEndpoint {
                protocol: EgressProtocol::Http,
                host: egress_addr.ip().to_string(),
                port: egress_addr.port(),
                username: None,
                password: None,
            }],
            2,
        ));
        let tunnel = tunnel_with(pool.clone(), Duration::from_secs(2));

        for _ in 0..2 {
            let err = tunnel
                .open(
                    Url::parse("ws://example.com/socket").unwrap(),
                    &upgrade_headers(),
                    detached_upgrade(),
                )
                .await
                .err()
                .unwrap();
            assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        }

        assert_eq!(pool.candidates()[0].consecutive_failures, 2);
        assert_eq!(pool.available_count(), 0);
    }
}
