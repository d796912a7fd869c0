//! Response body rewriting
//!
//! HTML, CSS and JavaScript responses are rewritten so every URL they
//! reference routes back through the proxy, frame-busting code is disarmed and
//! a small client shim patches runtime network APIs.

pub mod css;
pub mod encoding;
pub mod html;
pub mod js;
pub mod shim;

use url::{form_urlencoded, Url};

use crate::error::{BareError, Result};

/// Body types the rewriter understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    JavaScript,
}

impl ContentKind {
    /// Classify a `Content-Type` value; `None` means pass the body through
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => Some(ContentKind::Html),
            "text/css" => Some(ContentKind::Css),
            "text/javascript"
            | "application/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
            | "text/ecmascript" => Some(ContentKind::JavaScript),
            _ => None,
        }
    }
}

/// Schemes and prefixes that never go through the proxy
const PASSTHROUGH_PREFIXES: &[&str] = &[
    "#",
    "javascript:",
    "data:",
    "blob:",
    "mailto:",
    "tel:",
    "about:",
];

/// Everything needed to rewrite one response
#[derive(Debug, Clone)]
pub struct RewriteContext {
    base_url: Url,
    proxy_endpoint: String,
    ws_endpoint: String,
}

impl RewriteContext {
    pub fn new(base_url: Url, proxy_endpoint: impl Into<String>, ws_endpoint: impl Into<String>) -> Self {
        Self {
            base_url,
            proxy_endpoint: proxy_endpoint.into(),
            ws_endpoint: ws_endpoint.into(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn proxy_endpoint(&self) -> &str {
        &self.proxy_endpoint
    }

    pub fn ws_endpoint(&self) -> &str {
        &self.ws_endpoint
    }

    /// Same context resolving relative URLs against a different base
    pub fn with_base(&self, base_url: Url) -> Self {
        Self {
            base_url,
            ..self.clone()
        }
    }

    /// Proxied form of an absolute URL
    pub fn proxied(&self, absolute: &str) -> String {
        proxied_url(&self.proxy_endpoint, absolute)
    }

    /// Proxied WebSocket form of an absolute `ws(s)` URL
    pub fn proxied_ws(&self, absolute: &str) -> String {
        proxied_url(&self.ws_endpoint, absolute)
    }

    /// Rewrite a URL found in a document
    ///
    /// Returns `None` when the URL must be left as written: fragments,
    /// non-network schemes, URLs already pointing at the proxy and anything
    /// that does not resolve to http(s).
    pub fn rewrite_url(&self, raw: &str) -> Option<String> {
        let decoded = raw.trim().replace("&amp;", "&");
        let value = decoded.as_str();
        if value.is_empty() {
            return None;
        }

        let lower = value.to_ascii_lowercase();
        if PASSTHROUGH_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return None;
        }
        if value.starts_with(&self.proxy_endpoint) || value.starts_with(&self.ws_endpoint) {
            return None;
        }

        // Absolute URLs are encoded exactly as written.
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Some(self.proxied(value));
        }

        let resolved = self.base_url.join(value).ok()?;
        match resolved.scheme() {
            "http" | "https" => Some(self.proxied(resolved.as_str())),
            _ => None,
        }
    }
}

/// `<endpoint>?url=<percent-encoded absolute URL>`
pub fn proxied_url(endpoint: &str, absolute: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(absolute.as_bytes()).collect();
    format!("{}?url={}", endpoint, encoded)
}

/// Recover the target URL from a proxied URL produced by [`proxied_url`]
pub fn unwrap_proxied_url(endpoint: &str, candidate: &str) -> Option<String> {
    let rest = candidate.strip_prefix(endpoint)?;
    let query = rest.strip_prefix('?')?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
}

/// Rewrites one decoded body
pub trait ContentRewriter: Send + Sync {
    fn rewrite(&self, body: &[u8], kind: ContentKind, ctx: &RewriteContext) -> Result<Vec<u8>>;
}

/// Regex-driven rewriter for HTML, CSS and JavaScript
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternRewriter;

impl ContentRewriter for PatternRewriter {
    fn rewrite(&self, body: &[u8], kind: ContentKind, ctx: &RewriteContext) -> Result<Vec<u8>> {
        let rewritten = match kind {
            ContentKind::Html => html::rewrite_html(body, ctx),
            ContentKind::Css => css::rewrite_css(body, ctx),
            ContentKind::JavaScript => js::rewrite_js(body, ctx),
        };
        Ok(rewritten)
    }
}

/// Decode, then rewrite a buffered upstream body
///
/// The result is always identity-encoded. Any error leaves the caller free to
/// serve the original bytes.
pub fn rewrite_body(
    rewriter: &dyn ContentRewriter,
    body: &[u8],
    kind: ContentKind,
    content_encoding: Option<&str>,
    max_decoded_bytes: usize,
    ctx: &RewriteContext,
) -> Result<Vec<u8>> {
    let decoded = encoding::decode(body, content_encoding, max_decoded_bytes)?;
    if decoded.len() > max_decoded_bytes {
        return Err(BareError::Rewrite(format!(
            "decoded body exceeds {} bytes",
            max_decoded_bytes
        )));
    }
    rewriter.rewrite(&decoded, kind, ctx)
}
