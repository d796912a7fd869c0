//! Dialing through egress proxies
//!
//! HTTP egresses are driven with `CONNECT`, SOCKS5 egresses through
//! tokio-socks. Both hand back a plain TCP stream that already reaches the
//! target, ready for TLS or HTTP on top.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::config::EgressProtocol;
use crate::error::{BareError, ConnectFailureKind, Result};
use crate::models::EgressCandidate;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Open a tunnel to `host:port` through the candidate
pub async fn connect_through(candidate: &EgressCandidate, host: &str, port: u16) -> Result<TcpStream> {
    let target = format_authority(host, port);
    debug!(egress = %candidate, target = %target, "Dialing through egress");

    let result = match candidate.protocol {
        EgressProtocol::Http => connect_via_http_proxy(candidate, host, port).await,
        EgressProtocol::Socks5 => connect_via_socks5_proxy(candidate, host, port).await,
    };

    result.map_err(|e| {
        BareError::connect(
            ConnectFailureKind::Egress,
            format!("{} -> {}: {}", candidate, target, e),
        )
    })
}

/// Open a plain connection to an HTTP egress for absolute-form requests
pub async fn connect_to_egress(candidate: &EgressCandidate) -> Result<TcpStream> {
    let stream = TcpStream::connect(candidate.address()).await.map_err(|e| {
        BareError::connect(ConnectFailureKind::Egress, format!("{}: {}", candidate, e))
    })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn connect_via_http_proxy(
    proxy: &EgressCandidate,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy.address()).await?;
    let _ = stream.set_nodelay(true);

    let authority = format_authority(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(credential) = &proxy.credential {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", credential.basic_auth()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if !status_line.starts_with("HTTP/1.") || status != "200" {
        anyhow::bail!("CONNECT refused: {}", status_line);
    }

    Ok(stream)
}

/// Read exactly up to the blank line ending the response head, so no tunnel
/// bytes are consumed.
async fn read_response_head(stream: &mut TcpStream) -> std::result::Result<String, anyhow::Error> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            anyhow::bail!("CONNECT response head too large");
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("egress closed during CONNECT");
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn connect_via_socks5_proxy(
    proxy: &EgressCandidate,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy.address()).await?;
    let _ = socket.set_nodelay(true);

    let stream = match &proxy.credential {
        Some(credential) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (target_host, target_port),
                &credential.username,
                &credential.password,
            )
            .await?
        }
        None => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?,
    };

    Ok(stream.into_inner())
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
