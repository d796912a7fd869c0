//! HTTP server using Axum
//!
//! Serves the proxy, WebSocket, info and health routes on one listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{BareError, Result};
use crate::proxy::{
    EgressPool, Forwarder, ForwarderConfig, HeaderSanitizer, RateLimiter, UpstreamConnector,
    WebSocketTunnel,
};
use crate::rewrite::PatternRewriter;

use super::routes;

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub started_at: Instant,
    pub rate_limiter: RateLimiter,
    pub egress_pool: Arc<EgressPool>,
    pub forwarder: Arc<Forwarder>,
    pub tunnel: Arc<WebSocketTunnel>,
}

impl AppState {
    /// Wire the proxy core together from configuration
    pub fn new(config: Config) -> Result<Self> {
        let egress_pool = Arc::new(EgressPool::from_config(&config.egress));
        let connector = Arc::new(UpstreamConnector::new(
            egress_pool.clone(),
            config.upstream.connect_timeout,
        )?);
        let sanitizer = HeaderSanitizer::from_config(&config);

        let forwarder = Forwarder::new(
            connector.clone(),
            sanitizer.clone(),
            Arc::new(PatternRewriter),
            ForwarderConfig::from_config(&config),
        );
        let tunnel = WebSocketTunnel::new(connector, sanitizer, config.upstream.request_timeout);

        Ok(Self {
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            egress_pool,
            forwarder: Arc::new(forwarder),
            tunnel: Arc::new(tunnel),
            started_at: Instant::now(),
            config: Arc::new(config),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Bare proxy server
pub struct BareServer {
    state: AppState,
}

impl BareServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        routes::create_router(self.state.clone())
    }

    /// Run the server until the shutdown channel flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;

        info!(
            "Bare proxy listening on {} (proxy endpoint {})",
            addr,
            self.state.config.proxy_endpoint()
        );

        serve(listener, self.router(), shutdown).await?;

        info!("Bare proxy shut down");
        Ok(())
    }
}

/// Serve `router` on an already bound listener
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
    .map_err(|e| BareError::Internal(e.to_string()))
}
