use serde::Serialize;

/// Body of the liveness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: String,
    pub server: &'static str,
    /// Seconds since startup
    pub uptime: u64,
}

/// Advertised endpoints, relative to the proxy origin
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub proxy: String,
    pub websocket: String,
    pub info: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_requests: u32,
    pub tracked_clients: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EgressInfo {
    pub configured: usize,
    pub available: usize,
}

/// Body of the server information endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server: &'static str,
    pub version: &'static str,
    pub language: &'static str,
    pub uptime: u64,
    pub endpoints: EndpointInfo,
    pub features: Vec<&'static str>,
    pub rate_limit: RateLimitInfo,
    pub egress: EgressInfo,
}
