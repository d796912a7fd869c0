//! Bare Proxy - Entry Point
//!
//! Starts the proxy server and the maintenance service with graceful shutdown support.

use std::sync::Arc;

use bare_proxy::api::{AppState, BareServer};
use bare_proxy::services::{MaintenanceConfig, MaintenanceHandle, MaintenanceService};
use bare_proxy::{Config, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log.level, &config.log.format);

    info!("Starting Bare Proxy v{}", env!("CARGO_PKG_VERSION"));
    info!(
        origin = %config.server.origin,
        prefix = %config.server.prefix,
        rewrite = config.rewrite.enabled,
        rate_limit = config.rate_limit.enabled,
        egress = config.egress.endpoints.len(),
        "Configuration loaded"
    );

    let maintenance_config = MaintenanceConfig::from_config(&config);
    let state = AppState::new(config)?;

    // Start maintenance service
    let (maintenance_handle, maintenance_shutdown) = MaintenanceHandle::new();
    let maintenance = MaintenanceService::new(
        state.rate_limiter.clone(),
        Arc::clone(&state.egress_pool),
        maintenance_config,
    );
    let maintenance_task = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });

    // Start proxy server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = BareServer::new(state);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    maintenance_handle.shutdown();

    let _ = tokio::join!(server_task, maintenance_task);

    info!("Bare Proxy stopped");
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides `LOG_LEVEL`
fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bare_proxy={},tower_http={}", level, level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
