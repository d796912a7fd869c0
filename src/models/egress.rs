use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::config::{EgressEndpoint, EgressProtocol};

/// Credentials presented to an egress proxy
#[derive(Clone, PartialEq, Eq)]
pub struct EgressCredential {
    pub username: String,
    pub password: String,
}

impl EgressCredential {
    /// Value for a `Proxy-Authorization` header
    pub fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(credentials.as_bytes()))
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for EgressCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One outbound network identity in the rotation pool
#[derive(Debug, Clone)]
pub struct EgressCandidate {
    pub id: usize,
    pub protocol: EgressProtocol,
    pub host: String,
    pub port: u16,
    pub credential: Option<EgressCredential>,
    /// Operator switch; inactive candidates are never selected
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_used: Option<Instant>,
}

impl EgressCandidate {
    pub fn from_endpoint(id: usize, endpoint: &EgressEndpoint) -> Self {
        let credential = endpoint.username.as_ref().map(|username| EgressCredential {
            username: username.clone(),
            password: endpoint.password.clone().unwrap_or_default(),
        });

        Self {
            id,
            protocol: endpoint.protocol,
            host: endpoint.host.clone(),
            port: endpoint.port,
            credential,
            active: true,
            consecutive_failures: 0,
            last_used: None,
        }
    }

    /// Whether the candidate may be handed out under the given threshold
    pub fn is_eligible(&self, failure_threshold: u32) -> bool {
        self.active && self.consecutive_failures < failure_threshold
    }

    /// `host:port` with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for EgressCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol.as_str(), self.address())
    }
}
