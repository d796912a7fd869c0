//! Request forwarder
//!
//! Issues one upstream request per inbound proxy request. Request bodies are
//! streamed through unbuffered. Response bodies are streamed back untouched
//! unless they are HTML, CSS or JavaScript small enough to buffer, in which
//! case they are decoded and rewritten first.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body as HttpBody;
use hyper_util::rt::TokioIo;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};
use url::{Position, Url};

use crate::config::Config;
use crate::error::{BareError, ConnectFailureKind, Result};
use crate::proxy::headers::HeaderSanitizer;
use crate::proxy::transport::UpstreamConnector;
use crate::rewrite::{rewrite_body, ContentKind, ContentRewriter, RewriteContext};

/// Forwarder settings
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Deadline covering connect, response headers and any buffering
    pub request_timeout: Duration,
    pub rewrite_enabled: bool,
    /// Largest body buffered for rewriting
    pub max_rewrite_bytes: usize,
    pub proxy_endpoint: String,
    pub ws_endpoint: String,
}

impl ForwarderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: config.upstream.request_timeout,
            rewrite_enabled: config.rewrite.enabled,
            max_rewrite_bytes: config.rewrite.max_body_bytes,
            proxy_endpoint: config.proxy_endpoint(),
            ws_endpoint: config.ws_endpoint(),
        }
    }
}

/// One inbound request bound for `target`
pub struct ProxyRequest {
    pub target: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// Absent for GET and HEAD
    pub body: Option<Body>,
}

/// Parse the `url` query value of an HTTP proxy request
pub fn parse_http_target(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| BareError::InvalidTarget(format!("{}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(BareError::InvalidTarget(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(BareError::InvalidTarget(format!("{}: missing host", raw)));
    }
    Ok(url)
}

/// Buffered body, or the part read before the size limit was crossed
enum Collected<B> {
    Complete(Bytes),
    Overflow { prefix: Vec<Bytes>, rest: B },
}

/// Forwards proxy requests upstream
pub struct Forwarder {
    connector: Arc<UpstreamConnector>,
    sanitizer: HeaderSanitizer,
    rewriter: Arc<dyn ContentRewriter>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(
        connector: Arc<UpstreamConnector>,
        sanitizer: HeaderSanitizer,
        rewriter: Arc<dyn ContentRewriter>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            connector,
            sanitizer,
            rewriter,
            config,
        }
    }

    pub fn sanitizer(&self) -> &HeaderSanitizer {
        &self.sanitizer
    }

    /// Rewrite context for a page fetched from `base`
    pub fn context(&self, base: Url) -> RewriteContext {
        RewriteContext::new(
            base,
            self.config.proxy_endpoint.clone(),
            self.config.ws_endpoint.clone(),
        )
    }

    /// Forward a request and produce the response for the client
    #[instrument(skip(self, request), fields(method = %request.method, target = %request.target))]
    pub async fn forward(&self, request: ProxyRequest) -> Result<Response<Body>> {
        let deadline = Instant::now() + self.config.request_timeout;
        let ProxyRequest {
            target,
            method,
            headers,
            body,
        } = request;

        let connection = timeout_at(deadline, self.connector.connect(&target, true))
            .await
            .map_err(|_| BareError::UpstreamTimeout)??;

        let credential = connection
            .egress
            .as_ref()
            .filter(|_| connection.absolute_form)
            .and_then(|egress| egress.credential.as_ref());
        let outbound_headers = self.sanitizer.request_headers(&headers, &target, credential);

        let uri = if connection.absolute_form {
            &target[..Position::AfterQuery]
        } else {
            &target[Position::BeforePath..Position::AfterQuery]
        };

        let body = match method {
            Method::GET | Method::HEAD => Body::empty(),
            _ => body.unwrap_or_else(Body::empty),
        };

        let mut outbound = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| BareError::InvalidRequest(format!("Failed to build request: {}", e)))?;
        *outbound.headers_mut() = outbound_headers;

        let io = TokioIo::new(connection.stream);
        let egress = connection.egress;
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(handshake) => handshake,
            Err(e) => {
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(BareError::connect(
                    ConnectFailureKind::Protocol,
                    format!("Handshake failed: {}", e),
                ));
            }
        };

        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let upstream = match timeout_at(deadline, sender.send_request(outbound)).await {
            Ok(Ok(response)) => {
                self.connector.report_outcome(egress.as_ref(), true);
                response
            }
            Ok(Err(e)) => {
                driver.abort();
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(classify_hyper_error(&e));
            }
            Err(_) => {
                warn!("Upstream did not answer within {:?}", self.config.request_timeout);
                driver.abort();
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(BareError::UpstreamTimeout);
            }
        };

        let (parts, incoming) = upstream.into_parts();
        let ctx = self.context(target.clone());
        let mut response_headers = self.sanitizer.response_headers(&parts.headers, &ctx);

        let kind = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentKind::from_content_type);

        let kind = match kind {
            Some(kind) if self.should_buffer(&method, parts.status, &parts.headers) => kind,
            _ => {
                debug!(status = %parts.status, "Streaming upstream body");
                return Ok(build_response(parts.status, response_headers, Body::new(incoming)));
            }
        };

        let collected = match timeout_at(
            deadline,
            collect_bounded(incoming, self.config.max_rewrite_bytes),
        )
        .await
        {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                driver.abort();
                self.connector.report_outcome(egress.as_ref(), false);
                return Err(classify_hyper_error(&e));
            }
            Err(_) => {
                driver.abort();
                return Err(BareError::UpstreamTimeout);
            }
        };

        let original = match collected {
            Collected::Complete(bytes) => bytes,
            Collected::Overflow { prefix, rest } => {
                debug!(
                    limit = self.config.max_rewrite_bytes,
                    "Body exceeds rewrite limit, streaming untouched"
                );
                let prefix = stream::iter(prefix.into_iter().map(Ok::<_, hyper::Error>));
                let body = Body::from_stream(prefix.chain(rest.into_data_stream()));
                return Ok(build_response(parts.status, response_headers, body));
            }
        };

        let content_encoding = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match self.rewrite(original.clone(), kind, content_encoding, ctx).await {
            Ok(rewritten) => {
                response_headers.remove(header::CONTENT_ENCODING);
                response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                info!(
                    status = %parts.status,
                    original_bytes = original.len(),
                    rewritten_bytes = rewritten.len(),
                    "Rewrote {:?} response",
                    kind
                );
                Ok(build_response(parts.status, response_headers, Body::from(rewritten)))
            }
            Err(e) => {
                warn!(error = %e, "Rewrite failed, serving original body");
                Ok(build_response(parts.status, response_headers, Body::from(original)))
            }
        }
    }

    /// Whether a rewritable response should be buffered at all
    fn should_buffer(&self, method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
        if !self.config.rewrite_enabled || method == Method::HEAD {
            return false;
        }
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return false;
        }

        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());
        !matches!(declared, Some(len) if len > self.config.max_rewrite_bytes)
    }

    async fn rewrite(
        &self,
        body: Bytes,
        kind: ContentKind,
        content_encoding: Option<String>,
        ctx: RewriteContext,
    ) -> Result<Vec<u8>> {
        let rewriter = self.rewriter.clone();
        let limit = self.config.max_rewrite_bytes;

        tokio::task::spawn_blocking(move || {
            rewrite_body(
                rewriter.as_ref(),
                &body,
                kind,
                content_encoding.as_deref(),
                limit,
                &ctx,
            )
        })
        .await
        .map_err(|e| BareError::Rewrite(format!("rewrite task failed: {}", e)))?
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Read a body into memory unless it grows past `limit`
async fn collect_bounded<B>(mut body: B, limit: usize) -> std::result::Result<Collected<B>, B::Error>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    let mut chunks = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        total += data.len();
        chunks.push(data);
        if total > limit {
            return Ok(Collected::Overflow { prefix: chunks, rest: body });
        }
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Ok(Collected::Complete(buf.freeze()))
}

/// Map a hyper client error onto the upstream failure taxonomy
fn classify_hyper_error(err: &hyper::Error) -> BareError {
    if err.is_timeout() {
        return BareError::UpstreamTimeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return BareError::connect(ConnectFailureKind::from_io(io), err.to_string());
        }
        source = cause.source();
    }

    if err.is_incomplete_message() || err.is_closed() {
        return BareError::connect(ConnectFailureKind::ConnectionReset, err.to_string());
    }
    BareError::connect(ConnectFailureKind::Protocol, err.to_string())
}
