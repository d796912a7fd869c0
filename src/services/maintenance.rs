//! Periodic maintenance of shared proxy state
//!
//! Runs independently of request flow:
//! - sweeps expired rate limit windows
//! - clears egress failure counters so excluded candidates rejoin rotation
//! - optionally rotates the egress cursor on a timer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::proxy::middleware::RateLimiter;
use crate::proxy::rotation::EgressPool;

/// Maintenance timer configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often expired rate limit windows are evicted
    pub rate_limit_sweep: Duration,
    /// How often egress failure counters are cleared
    pub egress_reset: Duration,
    /// Timed egress rotation (None disables)
    pub egress_rotate: Option<Duration>,
}

impl MaintenanceConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate_limit_sweep: config.rate_limit.sweep_interval,
            egress_reset: config.egress.reset_interval,
            egress_rotate: config.egress.rotate_interval,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            rate_limit_sweep: Duration::from_secs(60),
            egress_reset: Duration::from_secs(600),
            egress_rotate: None,
        }
    }
}

/// Maintenance service
pub struct MaintenanceService {
    rate_limiter: RateLimiter,
    egress_pool: Arc<EgressPool>,
    config: MaintenanceConfig,
}

impl MaintenanceService {
    pub fn new(
        rate_limiter: RateLimiter,
        egress_pool: Arc<EgressPool>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            rate_limiter,
            egress_pool,
            config,
        }
    }

    /// Run until the shutdown channel flips to `true`
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting maintenance service (sweep every {:?}, egress reset every {:?})",
            self.config.rate_limit_sweep, self.config.egress_reset
        );

        let mut sweep = ticker(self.config.rate_limit_sweep);
        let mut reset = ticker(self.config.egress_reset);
        let mut rotate = self.config.egress_rotate.map(ticker);

        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep_rate_limits(),
                _ = reset.tick() => self.reset_egress(),
                _ = next_tick(&mut rotate) => self.rotate_egress(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintenance service shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn sweep_rate_limits(&self) {
        let evicted = self.rate_limiter.cleanup();
        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.rate_limiter.client_count(),
                "Evicted expired rate limit windows"
            );
        }
    }

    fn reset_egress(&self) {
        let restored = self.egress_pool.reset_failures();
        debug!(restored, "Egress failure sweep complete");
    }

    fn rotate_egress(&self) {
        if let Some(candidate) = self.egress_pool.rotate() {
            debug!(egress = %candidate, "Timed egress rotation");
        }
    }
}

/// Interval whose first tick is one full period away
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle for stopping the maintenance service
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for MaintenanceHandle {
    fn default() -> Self {
        Self::new().0
    }
}
