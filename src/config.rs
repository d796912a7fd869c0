use crate::error::{BareError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and route configuration
    pub server: ServerConfig,
    /// Per-client admission control
    pub rate_limit: RateLimitConfig,
    /// Upstream egress identities
    pub egress: EgressConfig,
    /// Upstream request behaviour
    pub upstream: UpstreamConfig,
    /// Content rewriting
    pub rewrite: RewriteConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on (default: 3000)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Public origin of this proxy, used to build proxied URLs
    pub origin: Url,
    /// Route prefix for the proxy, websocket and info endpoints
    pub prefix: String,
    /// Optional directory served for non-API paths
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Fixed window length
    pub window: Duration,
    /// Requests admitted per window and client
    pub max_requests: u32,
    /// How often stale windows are evicted
    pub sweep_interval: Duration,
    /// Trust X-Forwarded-For / X-Real-IP for the client identity
    pub trust_forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressProtocol {
    Http,
    Socks5,
}

impl EgressProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressProtocol::Http => "http",
            EgressProtocol::Socks5 => "socks5",
        }
    }
}

/// One configured egress proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressEndpoint {
    pub protocol: EgressProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Candidates in rotation order
    pub endpoints: Vec<EgressEndpoint>,
    /// Consecutive failures before a candidate leaves rotation
    pub failure_threshold: u32,
    /// How often failure counters are cleared
    pub reset_interval: Duration,
    /// Timed rotation period (None disables)
    pub rotate_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgentMode {
    /// Pick from a fixed pool of browser user agents
    Rotate,
    /// Forward the client's own user agent
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Timeout for establishing the upstream connection
    pub connect_timeout: Duration,
    /// Deadline for connect plus response headers
    pub request_timeout: Duration,
    /// User-Agent policy for outbound requests
    pub user_agent: UserAgentMode,
}

#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Rewrite HTML/CSS/JS bodies
    pub enabled: bool,
    /// Largest body buffered for rewriting; larger bodies stream untouched
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let port_raw = env::var("BARE_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "3000".to_string());
        let port: u16 = port_raw.parse().map_err(|_| {
            BareError::InvalidConfig("BARE_PORT must be a valid port number".into())
        })?;

        let origin_raw = get_env_or("BARE_ORIGIN", &format!("http://localhost:{}", port));
        let origin = parse_origin(&origin_raw)?;

        let rotate_secs = parse_num::<u64>("BARE_EGRESS_ROTATE_SECS", "30")?;

        Ok(Config {
            server: ServerConfig {
                port,
                host: get_env_or("BARE_HOST", "0.0.0.0"),
                origin,
                prefix: normalize_prefix(&get_env_or("BARE_PREFIX", "/bare/v1")),
                static_dir: env::var("BARE_STATIC_DIR")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
            },
            rate_limit: RateLimitConfig {
                enabled: parse_bool("BARE_RATE_LIMIT_ENABLED", "true")?,
                window: Duration::from_secs(
                    parse_num::<u64>("BARE_RATE_LIMIT_WINDOW_SECS", "60")?.max(1),
                ),
                max_requests: parse_num("BARE_RATE_LIMIT_MAX_REQUESTS", "300")?,
                sweep_interval: Duration::from_secs(
                    parse_num::<u64>("BARE_RATE_LIMIT_SWEEP_SECS", "60")?.max(1),
                ),
                trust_forwarded: parse_bool("BARE_TRUST_FORWARDED", "false")?,
            },
            egress: EgressConfig {
                endpoints: parse_egress_pool(&get_env_or("BARE_EGRESS_POOL", ""))?,
                failure_threshold: parse_num::<u32>("BARE_EGRESS_FAILURE_THRESHOLD", "3")?.max(1),
                reset_interval: Duration::from_secs(
                    parse_num::<u64>("BARE_EGRESS_RESET_SECS", "600")?.max(1),
                ),
                rotate_interval: (rotate_secs > 0).then(|| Duration::from_secs(rotate_secs)),
            },
            upstream: UpstreamConfig {
                connect_timeout: Duration::from_secs(
                    parse_num::<u64>("BARE_CONNECT_TIMEOUT_SECS", "10")?.max(1),
                ),
                request_timeout: Duration::from_secs(
                    parse_num::<u64>("BARE_REQUEST_TIMEOUT_SECS", "30")?.max(1),
                ),
                user_agent: match get_env_or("BARE_USER_AGENT_MODE", "rotate")
                    .to_lowercase()
                    .as_str()
                {
                    "rotate" => UserAgentMode::Rotate,
                    "passthrough" | "pass-through" | "client" => UserAgentMode::Passthrough,
                    other => {
                        return Err(BareError::InvalidConfig(format!(
                            "BARE_USER_AGENT_MODE has unsupported value: {}",
                            other
                        )))
                    }
                },
            },
            rewrite: RewriteConfig {
                enabled: parse_bool("BARE_REWRITE_ENABLED", "true")?,
                max_body_bytes: parse_num("BARE_MAX_REWRITE_BYTES", "10485760")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the listener address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Absolute URL of the HTTP proxy endpoint
    pub fn proxy_endpoint(&self) -> String {
        format!("{}{}/proxy", origin_str(&self.server.origin), self.server.prefix)
    }

    /// Absolute URL of the WebSocket proxy endpoint
    pub fn ws_endpoint(&self) -> String {
        let origin = origin_str(&self.server.origin);
        let ws_origin = match origin.strip_prefix("https://") {
            Some(rest) => format!("wss://{}", rest),
            None => format!("ws://{}", origin.trim_start_matches("http://")),
        };
        format!("{}{}/ws", ws_origin, self.server.prefix)
    }
}

fn origin_str(origin: &Url) -> String {
    origin.as_str().trim_end_matches('/').to_string()
}

fn parse_origin(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        BareError::InvalidConfig(format!("BARE_ORIGIN must be a valid URL: {}", e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(BareError::InvalidConfig(
            "BARE_ORIGIN must use http or https".into(),
        ));
    }
    if url.host_str().is_none() {
        return Err(BareError::InvalidConfig(
            "BARE_ORIGIN must include a host".into(),
        ));
    }

    // Only the origin is meaningful; drop any path the operator supplied.
    let mut origin = url;
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    Ok(origin)
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parse_egress_pool(raw: &str) -> Result<Vec<EgressEndpoint>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_egress_endpoint)
        .collect()
}

pub(crate) fn parse_egress_endpoint(raw: &str) -> Result<EgressEndpoint> {
    let url = Url::parse(raw).map_err(|e| {
        BareError::InvalidConfig(format!("BARE_EGRESS_POOL entry must be a valid URL: {}", e))
    })?;

    // Reject URLs that carry request-specific components.
    if url.fragment().is_some() || url.query().is_some() {
        return Err(BareError::InvalidConfig(
            "BARE_EGRESS_POOL entries must not include query/fragment".into(),
        ));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(BareError::InvalidConfig(
            "BARE_EGRESS_POOL entries must not include a path".into(),
        ));
    }

    let protocol = match url.scheme().to_lowercase().as_str() {
        "http" | "https" => EgressProtocol::Http,
        "socks5" | "socks5h" => EgressProtocol::Socks5,
        other => {
            return Err(BareError::InvalidConfig(format!(
                "BARE_EGRESS_POOL has unsupported scheme: {}",
                other
            )))
        }
    };

    let host = url.host_str().ok_or_else(|| {
        BareError::InvalidConfig("BARE_EGRESS_POOL entries must include a host".into())
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let port = match url.port() {
        Some(p) => p,
        None => match protocol {
            EgressProtocol::Http => 80,
            EgressProtocol::Socks5 => 1080,
        },
    };

    let username = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };

    let password = match (protocol, &username, url.password()) {
        (_, None, _) => None,
        (EgressProtocol::Http, Some(_), None) => Some(String::new()),
        (EgressProtocol::Http, Some(_), Some(p)) => Some(p.to_string()),
        (EgressProtocol::Socks5, Some(_), Some(p)) if !p.is_empty() => Some(p.to_string()),
        (EgressProtocol::Socks5, Some(_), _) => {
            return Err(BareError::InvalidConfig(
                "BARE_EGRESS_POOL socks5 auth requires a non-empty password".into(),
            ))
        }
    };

    Ok(EgressEndpoint {
        protocol,
        host: host.to_string(),
        port,
        username,
        password,
    })
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(key: &str, default: &str) -> Result<bool> {
    match get_env_or(key, default).trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BareError::InvalidConfig(format!("{} must be a boolean", key))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| BareError::InvalidConfig(format!("{} must be a valid number", key)))
}
