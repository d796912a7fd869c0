//! Per-client fixed window rate limiting
//!
//! Each client identity owns one window. DashMap's entry API holds the shard
//! lock for the whole read-modify-write, so concurrent requests from the same
//! client can never both take the last slot of a window.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{BareError, Result};

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    window_start: Instant,
    count: u32,
}

/// Outcome of an admitted request, used for `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes
    pub reset_after: Duration,
}

impl RateLimitStatus {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset_at = SystemTime::now()
            .checked_add(self.reset_after)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();

        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at));
    }
}

/// Rate limiter for proxy requests
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    windows: Arc<DashMap<String, RateLimitWindow>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        Self {
            enabled,
            windows: Arc::new(DashMap::new()),
            max_requests: max_requests.max(1),
            window: window.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.enabled, config.max_requests, config.window)
    }

    /// Create a disabled rate limiter
    pub fn disabled() -> Self {
        Self::new(false, 300, Duration::from_secs(60))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check if a request from the given client is allowed
    ///
    /// Returns `Ok(None)` when limiting is disabled.
    pub fn check(&self, client: &str) -> Result<Option<RateLimitStatus>> {
        self.check_at(client, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub fn check_at(&self, client: &str, now: Instant) -> Result<Option<RateLimitStatus>> {
        if !self.enabled {
            return Ok(None);
        }

        let mut entry = self
            .windows
            .entry(client.to_string())
            .or_insert_with(|| RateLimitWindow {
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= self.window {
            // Window starts only ever move forward.
            entry.window_start = now.max(entry.window_start);
            entry.count = 0;
        }

        let reset_after = self
            .window
            .saturating_sub(now.saturating_duration_since(entry.window_start));

        if entry.count >= self.max_requests {
            let retry_after_secs = ceil_secs(reset_after).max(1);
            drop(entry);
            warn!(client, retry_after_secs, "Rate limit exceeded");
            return Err(BareError::RateLimited {
                client_ip: client.to_string(),
                retry_after_secs,
            });
        }

        entry.count += 1;
        let remaining = self.max_requests - entry.count;
        debug!(client, remaining, "Rate limit check passed");

        Ok(Some(RateLimitStatus {
            limit: self.max_requests,
            remaining,
            reset_after,
        }))
    }

    /// Boolean form of [`check`](Self::check)
    pub fn admit(&self, client: &str) -> bool {
        self.check(client).is_ok()
    }

    /// Drop windows that have fully expired, returning how many were evicted
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start) < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Get the number of tracked clients
    pub fn client_count(&self) -> usize {
        self.windows.len()
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
