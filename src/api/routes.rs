//! Route definitions

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::{cors_layer, RequestLogging};
use super::server::AppState;

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    let prefix = state.config.server.prefix.clone();
    let proxy = handlers::proxy::proxy;

    let informational = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(&format!("{}/info", prefix), get(handlers::info::server_info))
        .layer(cors_layer());

    let proxied = Router::new()
        .route(
            &format!("{}/proxy", prefix),
            get(proxy)
                .post(proxy)
                .put(proxy)
                .delete(proxy)
                .patch(proxy)
                .options(proxy),
        )
        .route(&format!("{}/ws", prefix), get(handlers::ws::websocket));

    let router = informational.merge(proxied);
    let router = match &state.config.server.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(handlers::not_found),
    };

    router
        .layer(middleware::from_fn(RequestLogging::log_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, EgressConfig, LogConfig, RateLimitConfig, RewriteConfig, ServerConfig,
        UpstreamConfig, UserAgentMode,
    };
    use crate::rewrite::proxied_url;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tower::ServiceExt;
    use url::{form_urlencoded, Url};

    const PREFIX: &str = "/bare/v1";

    fn test_config(max_requests: u32) -> Config {
        Config {
            server: ServerConfig {
                port: 3000,
                host: "127.0.0.1".into(),
                origin: Url::parse("http://localhost:3000").unwrap(),
                prefix: PREFIX.into(),
                static_dir: None,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                window: Duration::from_secs(60),
                max_requests,
                sweep_interval: Duration::from_secs(60),
                trust_forwarded: false,
            },
            egress: EgressConfig {
                endpoints: Vec::new(),
                failure_threshold: 3,
                reset_interval: Duration::from_secs(600),
                rotate_interval: None,
            },
            upstream: UpstreamConfig {
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(5),
                user_agent: UserAgentMode::Rotate,
            },
            rewrite: RewriteConfig {
                enabled: true,
                max_body_bytes: 1 << 20,
            },
            log: LogConfig {
                level: "info".into(),
                format: "pretty".into(),
            },
        }
    }

    fn peer(last_octet: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last_octet], 40000))
    }

    fn app(state: &AppState, from: SocketAddr) -> Router {
        create_router(state.clone()).layer(MockConnectInfo(from))
    }

    fn proxy_uri(target: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}/proxy?url={}", PREFIX, encoded)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Port nothing listens on
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn upstream_once(reply: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 2048];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&reply).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_health() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1)).oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["server"], "bare-proxy");
        assert!(json["uptime"].is_u64());
    }

    #[tokio::test]
    async fn test_info_reports_limits() {
        let state = AppState::new(test_config(42)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request("/bare/v1/info"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["language"], "rust");
        assert_eq!(json["endpoints"]["proxy"], "/bare/v1/proxy");
        assert_eq!(json["rateLimit"]["maxRequests"], 42);
        assert_eq!(json["rateLimit"]["windowSecs"], 60);
        assert_eq!(json["egress"]["configured"], 0);
        assert!(json["features"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("content-rewriting")));
    }

    #[tokio::test]
    async fn test_missing_url_is_bad_request() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request("/bare/v1/proxy"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["kind"], "INVALID_TARGET");
        assert!(json["message"].is_string());

        // Rejected requests do not consume the client's budget.
        assert_eq!(state.rate_limiter.client_count(), 0);
    }

    #[tokio::test]
    async fn test_unparsable_url_is_bad_request() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri("not a url")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["target"], "not a url");
    }

    #[tokio::test]
    async fn test_preflight() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/bare/v1/proxy")
                    .header("Origin", "https://embedder.example")
                    .header("Access-Control-Request-Method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_html_page_is_rewritten_end_to_end() {
        let html = r#"<html><head><title>t</title></head><body><a href="https://example.com/a">a</a></body></html>"#;
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nContent-Security-Policy: frame-ancestors 'none'\r\nConnection: close\r\n\r\n{}",
            html.len(),
            html
        );
        let upstream = upstream_once(reply.into_bytes()).await;

        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri(&format!("http://{}/", upstream))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(headers.get("content-security-policy").is_none());
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "9");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let expected = proxied_url("http://localhost:3000/bare/v1/proxy", "https://example.com/a");
        assert!(text.contains(&format!(r#"<a href="{}">"#, expected)));
        assert_eq!(text.matches("data-bare-shim").count(), 1);
        assert!(text.starts_with("<html><head><script data-bare-shim>"));
    }

    #[tokio::test]
    async fn test_refused_upstream_is_bad_gateway() {
        let target = format!("http://{}/", closed_port().await);
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri(&target)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["kind"], "UPSTREAM_CONNECTION_REFUSED");
        assert_eq!(json["target"], target);
    }

    #[tokio::test]
    async fn test_dns_failure_is_distinguished() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri("http://no-such-host.invalid/")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["kind"], "UPSTREAM_DNS_FAILURE");
        assert!(json["message"].as_str().unwrap().contains("DNS lookup failed"));
    }

    #[tokio::test]
    async fn test_hung_upstream_is_gateway_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let mut config = test_config(10);
        config.upstream.request_timeout = Duration::from_millis(200);
        let state = AppState::new(config).unwrap();

        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri(&format!("http://{}/", upstream))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json_body(response).await["kind"], "UPSTREAM_TIMEOUT");
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_identity() {
        let target = format!("http://{}/", closed_port().await);
        let state = AppState::new(test_config(2)).unwrap();

        for _ in 0..2 {
            let response = app(&state, peer(1))
                .oneshot(get_request(&proxy_uri(&target)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        let response = app(&state, peer(1))
            .oneshot(get_request(&proxy_uri(&target)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_some());
        assert_eq!(json_body(response).await["kind"], "RATE_LIMITED");

        let response = app(&state, peer(2))
            .oneshot(get_request(&proxy_uri(&target)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forwarded_for_ignored_unless_trusted() {
        let target = format!("http://{}/", closed_port().await);
        let state = AppState::new(test_config(1)).unwrap();

        let spoofed = |ip: &str| {
            Request::builder()
                .uri(proxy_uri(&target))
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        app(&state, peer(1)).oneshot(spoofed("1.1.1.1")).await.unwrap();
        let response = app(&state, peer(1)).oneshot(spoofed("2.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_websocket_upgrades_share_http_budget() {
        let upstream = closed_port().await;
        let state = AppState::new(test_config(2)).unwrap();

        for _ in 0..2 {
            let response = app(&state, peer(1))
                .oneshot(get_request(&proxy_uri(&format!("http://{}/", upstream))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        let upgrade = |target: &str| {
            let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
            Request::builder()
                .uri(format!("{}/ws?url={}", PREFIX, encoded))
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "websocket")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .body(Body::empty())
                .unwrap()
        };
        let ws_target = format!("ws://{}/socket", upstream);

        let response = app(&state, peer(1))
            .oneshot(upgrade(&ws_target))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_some());
        assert_eq!(json_body(response).await["kind"], "RATE_LIMITED");

        // Another identity is admitted and fails on the dead upstream instead.
        let response = app(&state, peer(2))
            .oneshot(upgrade(&ws_target))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request("/bare/v1/ws?url=wss%3A%2F%2Fexample.com%2F"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_not_found() {
        let state = AppState::new(test_config(10)).unwrap();
        let response = app(&state, peer(1))
            .oneshot(get_request("/nope"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["kind"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_websocket_tunnel_end_to_end() {
        // Upstream accepts the upgrade, then echoes raw bytes.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream_listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 2048];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
            }
            assert!(String::from_utf8_lossy(&head)
                .to_lowercase()
                .contains("upgrade: websocket"));
            socket
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
                )
                .await
                .unwrap();
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        let state = AppState::new(test_config(10)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(crate::api::server::serve(
            listener,
            create_router(state),
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let target: String =
            form_urlencoded::byte_serialize(format!("ws://{}/chat", upstream).as_bytes()).collect();
        let handshake = format!(
            "GET /bare/v1/ws?url={} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            target, proxy_addr
        );
        client.write_all(handshake.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
        assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
            .await
            .expect("no echo through tunnel")
            .unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    }
}
