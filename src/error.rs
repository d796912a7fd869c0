use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Classification of a failed upstream connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    DnsLookup,
    ConnectionRefused,
    ConnectionReset,
    Unreachable,
    Tls,
    Egress,
    Protocol,
    Other,
}

impl ConnectFailureKind {
    /// Human readable label used in error bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectFailureKind::DnsLookup => "DNS lookup failed",
            ConnectFailureKind::ConnectionRefused => "connection refused",
            ConnectFailureKind::ConnectionReset => "connection reset",
            ConnectFailureKind::Unreachable => "host unreachable",
            ConnectFailureKind::Tls => "TLS handshake failed",
            ConnectFailureKind::Egress => "egress proxy failed",
            ConnectFailureKind::Protocol => "upstream protocol error",
            ConnectFailureKind::Other => "connection failed",
        }
    }

    /// Map an I/O error raised while dialing or talking to the upstream
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectFailureKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ConnectFailureKind::ConnectionReset
            }
            ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable => ConnectFailureKind::Unreachable,
            _ => ConnectFailureKind::Other,
        }
    }
}

impl std::fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified error type for the bare proxy
#[derive(Error, Debug)]
pub enum BareError {
    // Request errors
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Rate limiting
    #[error("Rate limit exceeded for {client_ip}")]
    RateLimited { client_ip: String, retry_after_secs: u64 },

    // Upstream errors
    #[error("Upstream connection failed ({kind}): {message}")]
    UpstreamConnect {
        kind: ConnectFailureKind,
        message: String,
    },

    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("WebSocket upgrade failed: {0}")]
    UpgradeFailed(String),

    // Content rewriting
    #[error("Content rewrite failed: {0}")]
    Rewrite(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for bare proxy operations
pub type Result<T> = std::result::Result<T, BareError>;

impl BareError {
    /// Shorthand for an upstream connect failure
    pub fn connect(kind: ConnectFailureKind, message: impl Into<String>) -> Self {
        BareError::UpstreamConnect {
            kind,
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            BareError::InvalidTarget(_)
            | BareError::InvalidRequest(_)
            | BareError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            BareError::NotFound(_) => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            BareError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            BareError::UpstreamConnect { .. } | BareError::UpgradeFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 504 Gateway Timeout
            BareError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            BareError::Rewrite(_)
            | BareError::Io(_)
            | BareError::Http(_)
            | BareError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            BareError::InvalidTarget(_) => "INVALID_TARGET",
            BareError::InvalidRequest(_) => "INVALID_REQUEST",
            BareError::RateLimited { .. } => "RATE_LIMITED",
            BareError::UpstreamConnect { kind, .. } => match kind {
                ConnectFailureKind::DnsLookup => "UPSTREAM_DNS_FAILURE",
                ConnectFailureKind::ConnectionRefused => "UPSTREAM_CONNECTION_REFUSED",
                ConnectFailureKind::ConnectionReset => "UPSTREAM_CONNECTION_RESET",
                ConnectFailureKind::Unreachable => "UPSTREAM_UNREACHABLE",
                ConnectFailureKind::Tls => "UPSTREAM_TLS_FAILURE",
                ConnectFailureKind::Egress => "EGRESS_FAILURE",
                ConnectFailureKind::Protocol => "UPSTREAM_PROTOCOL_ERROR",
                ConnectFailureKind::Other => "UPSTREAM_CONNECT_FAILED",
            },
            BareError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            BareError::UpgradeFailed(_) => "UPGRADE_FAILED",
            BareError::Rewrite(_) => "REWRITE_FAILED",
            BareError::InvalidConfig(_) => "INVALID_CONFIG",
            BareError::NotFound(_) => "NOT_FOUND",
            BareError::Io(_) | BareError::Http(_) | BareError::Internal(_) => "INTERNAL",
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Render the structured error body, naming the target that failed
    pub fn to_response(&self, target: Option<&str>) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "kind": self.kind(),
            "message": self.to_string(),
            "target": target,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = (status, Json(body)).into_response();
        if let BareError::RateLimited {
            retry_after_secs, ..
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for BareError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}

// Convert from hyper errors
impl From<hyper::Error> for BareError {
    fn from(err: hyper::Error) -> Self {
        BareError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for BareError {
    fn from(err: url::ParseError) -> Self {
        BareError::InvalidTarget(err.to_string())
    }
}
