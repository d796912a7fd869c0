//! Admission control for proxied requests

mod client_ip;
mod rate_limit;

pub use client_ip::client_identity;
pub use rate_limit::{RateLimitStatus, RateLimiter};
