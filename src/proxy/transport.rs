//! Upstream transport
//!
//! Resolves and dials the target (directly or through the current egress
//! candidate), then layers TLS on top for `https`/`wss` targets.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};
use url::{Host, Url};

use crate::config::EgressProtocol;
use crate::error::{BareError, ConnectFailureKind, Result};
use crate::models::EgressCandidate;
use crate::proxy::egress;
use crate::proxy::rotation::EgressPool;

/// Where a target URL must be dialed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl UpstreamTarget {
    pub fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(BareError::InvalidTarget(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(BareError::InvalidTarget("missing host".into())),
        };

        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { host, port, tls })
    }
}

/// Raw upstream stream, either plain TCP or TLS
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An established upstream connection
pub struct UpstreamConnection {
    pub stream: UpstreamStream,
    /// Egress the connection leaves through, if any
    pub egress: Option<EgressCandidate>,
    /// The stream reaches an HTTP egress rather than the target, so requests
    /// must use absolute-form URIs.
    pub absolute_form: bool,
}

/// Dials upstream targets through the egress pool
pub struct UpstreamConnector {
    pool: Arc<EgressPool>,
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(pool: Arc<EgressPool>, connect_timeout: Duration) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| BareError::Internal(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        // Upstream requests are always spoken as HTTP/1.1.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            pool,
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }

    pub fn pool(&self) -> &Arc<EgressPool> {
        &self.pool
    }

    /// Record whether a request through `egress` got an upstream answer
    pub fn report_outcome(&self, egress: Option<&EgressCandidate>, succeeded: bool) {
        let Some(egress) = egress else {
            return;
        };
        if succeeded {
            self.pool.report_success(egress.id);
        } else {
            self.pool.report_failure(egress.id);
        }
    }

    /// Connect to the target named by `url`
    ///
    /// `allow_absolute_form` lets plain-http targets reuse an HTTP egress as a
    /// forward proxy instead of tunneling with CONNECT.
    ///
    /// Only dial failures are reported to the pool here. An established
    /// connection counts as a success once the upstream has answered, see
    /// [`report_outcome`](Self::report_outcome).
    #[instrument(skip(self), fields(target = %url))]
    pub async fn connect(&self, url: &Url, allow_absolute_form: bool) -> Result<UpstreamConnection> {
        let target = UpstreamTarget::from_url(url)?;
        let candidate = self.pool.current();

        let attempt = tokio::time::timeout(
            self.connect_timeout,
            self.dial(&target, candidate.as_ref(), allow_absolute_form),
        )
        .await;

        match attempt {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                if let Some(c) = &candidate {
                    self.pool.report_failure(c.id);
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    host = %target.host,
                    port = target.port,
                    "Upstream connect timed out after {:?}",
                    self.connect_timeout
                );
                if let Some(c) = &candidate {
                    self.pool.report_failure(c.id);
                }
                Err(BareError::UpstreamTimeout)
            }
        }
    }

    async fn dial(
        &self,
        target: &UpstreamTarget,
        candidate: Option<&EgressCandidate>,
        allow_absolute_form: bool,
    ) -> Result<UpstreamConnection> {
        let (tcp, absolute_form) = match candidate {
            None => (dial_direct(&target.host, target.port).await?, false),
            Some(c) if c.protocol == EgressProtocol::Http && !target.tls && allow_absolute_form => {
                (egress::connect_to_egress(c).await?, true)
            }
            Some(c) => (egress::connect_through(c, &target.host, target.port).await?, false),
        };

        let stream = if target.tls {
            UpstreamStream::Tls(Box::new(self.handshake(&target.host, tcp).await?))
        } else {
            UpstreamStream::Plain(tcp)
        };

        Ok(UpstreamConnection {
            stream,
            egress: candidate.cloned(),
            absolute_form,
        })
    }

    async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            BareError::connect(
                ConnectFailureKind::Tls,
                format!("invalid server name {}: {}", host, e),
            )
        })?;

        self.tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| BareError::connect(ConnectFailureKind::Tls, format!("{}: {}", host, e)))
    }
}

/// Resolve and connect without an egress, trying each resolved address
async fn dial_direct(host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<_> = lookup_host((host, port))
        .await
        .map_err(|e| BareError::connect(ConnectFailureKind::DnsLookup, format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(BareError::connect(
            ConnectFailureKind::DnsLookup,
            format!("{}: no addresses", host),
        ));
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                debug!(%addr, "Connected upstream");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "Upstream address failed");
                last_error = Some(e);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected));
    Err(BareError::connect(
        ConnectFailureKind::from_io(&err),
        format!("{}:{}: {}", host, port, err),
    ))
}
