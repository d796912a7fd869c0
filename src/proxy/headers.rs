//! Header sanitization for both directions of a proxied exchange

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use rand::seq::SliceRandom;
use tracing::debug;
use url::Url;

use crate::config::{Config, UserAgentMode};
use crate::models::EgressCredential;
use crate::rewrite::{encoding, unwrap_proxied_url, RewriteContext};

/// Browser user agents handed out in rotation
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
];

const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate, br";
const DEFAULT_CACHE_CONTROL: &str = "no-cache";

pub const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD";
pub const PREFLIGHT_MAX_AGE: &str = "86400";

/// Headers that reveal the client or an intermediate hop
const IDENTITY_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-server",
    "x-forwarded-user-agent",
    "x-original-forwarded-for",
    "forwarded",
    "via",
    "x-real-ip",
    "x-client-ip",
    "x-cluster-client-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "fastly-client-ip",
];

/// Upstream response headers that are never relayed
const BLOCKED_RESPONSE_HEADERS: &[&str] = &[
    "x-frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
    "server",
    "x-powered-by",
];

/// Check whether a header only applies to a single connection
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Header names listed in `Connection`, which are hop-by-hop as well
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Maps inbound client headers to upstream headers and back
#[derive(Debug, Clone)]
pub struct HeaderSanitizer {
    user_agent: UserAgentMode,
    proxy_endpoint: String,
    proxy_origin: String,
}

impl HeaderSanitizer {
    pub fn new(user_agent: UserAgentMode, proxy_endpoint: impl Into<String>, origin: &Url) -> Self {
        Self {
            user_agent,
            proxy_endpoint: proxy_endpoint.into(),
            proxy_origin: origin.origin().ascii_serialization(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.upstream.user_agent,
            config.proxy_endpoint(),
            &config.server.origin,
        )
    }

    /// Build the header set sent upstream for `target`
    ///
    /// `credential` is only supplied when the selected egress needs the
    /// request itself to carry `Proxy-Authorization` (absolute-form requests).
    pub fn request_headers(
        &self,
        inbound: &HeaderMap,
        target: &Url,
        credential: Option<&EgressCredential>,
    ) -> HeaderMap {
        let tokens = connection_tokens(inbound);
        let mut out = HeaderMap::with_capacity(inbound.len() + 6);

        for (name, value) in inbound {
            let lower = name.as_str();
            if is_hop_by_hop(lower)
                || tokens.iter().any(|t| t == lower)
                || IDENTITY_HEADERS.contains(&lower)
            {
                continue;
            }
            if name == header::HOST
                || name == header::USER_AGENT
                || name == header::REFERER
                || name == header::ORIGIN
                || name == header::ACCEPT_ENCODING
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }

        if let Ok(host) = HeaderValue::from_str(&authority(target)) {
            out.insert(header::HOST, host);
        }

        let user_agent = match self.user_agent {
            UserAgentMode::Passthrough => inbound.get(header::USER_AGENT).cloned(),
            UserAgentMode::Rotate => None,
        };
        out.insert(
            header::USER_AGENT,
            user_agent.unwrap_or_else(|| HeaderValue::from_static(random_user_agent())),
        );

        out.entry(header::ACCEPT)
            .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT));
        out.entry(header::ACCEPT_LANGUAGE)
            .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
        out.entry(header::CACHE_CONTROL)
            .or_insert(HeaderValue::from_static(DEFAULT_CACHE_CONTROL));
        out.insert(
            header::ACCEPT_ENCODING,
            accept_encoding(inbound.get(header::ACCEPT_ENCODING)),
        );

        if let Some(referer) = inbound
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.upstream_referer(v))
        {
            out.insert(header::REFERER, referer);
        }

        if inbound.contains_key(header::ORIGIN) {
            if let Ok(origin) = HeaderValue::from_str(&http_origin(target)) {
                out.insert(header::ORIGIN, origin);
            }
        }

        if let Some(credential) = credential {
            if let Ok(value) = HeaderValue::from_str(&credential.basic_auth()) {
                out.insert(header::PROXY_AUTHORIZATION, value);
            }
        }

        out
    }

    /// Build the header set returned to the client
    pub fn response_headers(&self, upstream: &HeaderMap, ctx: &RewriteContext) -> HeaderMap {
        let tokens = connection_tokens(upstream);
        let mut out = HeaderMap::with_capacity(upstream.len() + 5);

        for (name, value) in upstream {
            let lower = name.as_str();
            if is_hop_by_hop(lower)
                || tokens.iter().any(|t| t == lower)
                || BLOCKED_RESPONSE_HEADERS.contains(&lower)
                || lower.starts_with("access-control-")
            {
                continue;
            }

            if name == header::SET_COOKIE {
                let rewritten = value
                    .to_str()
                    .ok()
                    .map(|cookie| rewrite_set_cookie(cookie))
                    .and_then(|cookie| HeaderValue::from_str(&cookie).ok());
                match rewritten {
                    Some(cookie) => {
                        out.append(header::SET_COOKIE, cookie);
                    }
                    None => debug!("Dropping undecodable Set-Cookie header"),
                }
                continue;
            }

            if name == header::LOCATION || name == header::CONTENT_LOCATION {
                let rewritten = value
                    .to_str()
                    .ok()
                    .and_then(|location| ctx.rewrite_url(location))
                    .and_then(|location| HeaderValue::from_str(&location).ok());
                out.append(name.clone(), rewritten.unwrap_or_else(|| value.clone()));
                continue;
            }

            out.append(name.clone(), value.clone());
        }

        apply_cors(&mut out);
        out
    }

    /// Headers answering a CORS preflight on the proxy route
    pub fn preflight_headers(&self, request: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        apply_cors(&mut out);

        if let Some(requested) = request.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        out.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
        out
    }

    /// Referer the upstream should see
    ///
    /// Proxied page URLs are unwrapped to the page they stand for; any other
    /// URL on the proxy origin would leak the proxy and is dropped.
    fn upstream_referer(&self, referer: &str) -> Option<HeaderValue> {
        if let Some(original) = unwrap_proxied_url(&self.proxy_endpoint, referer) {
            return HeaderValue::from_str(&original).ok();
        }
        if referer.starts_with(&self.proxy_origin) {
            return None;
        }
        HeaderValue::from_str(referer).ok()
    }
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Set-Cookie"),
    );
}

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Keep only codings the rewriter can decode
fn accept_encoding(inbound: Option<&HeaderValue>) -> HeaderValue {
    let supported: Vec<&str> = inbound
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|coding| {
                    let name = coding.split(';').next().unwrap_or_default().trim();
                    name.eq_ignore_ascii_case("identity") || encoding::is_supported(name)
                })
                .collect()
        })
        .unwrap_or_default();

    if supported.is_empty() {
        return HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING);
    }
    HeaderValue::from_str(&supported.join(", "))
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING))
}

/// `host[:port]` with the port only when it differs from the scheme default
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Origin of the target as a page on it would send it
fn http_origin(target: &Url) -> String {
    let scheme = match target.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    };
    format!("{}://{}", scheme, authority(target))
}

/// Re-scope an upstream cookie to the proxy origin
///
/// `Domain` and `Path` would never match the proxy, and `SameSite` must be
/// `None` for the cookie to ride along on cross-site iframe requests.
/// `Secure` is always dropped because the browser may reach the proxy over
/// plain HTTP.
pub fn rewrite_set_cookie(cookie: &str) -> String {
    let mut parts = cookie.split(';').map(str::trim).filter(|p| !p.is_empty());
    let Some(pair) = parts.next() else {
        return cookie.to_string();
    };

    let mut out = vec![pair.to_string()];
    for attribute in parts {
        let name = attribute
            .split('=')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if matches!(name.as_str(), "secure" | "samesite" | "domain" | "path") {
            continue;
        }
        out.push(attribute.to_string());
    }

    out.push("Path=/".to_string());
    out.push("SameSite=None".to_string());
    out.join("; ")
}

/// Name check usable on `HeaderName` without allocation
pub fn is_identity_header(name: &HeaderName) -> bool {
    IDENTITY_HEADERS.contains(&name.as_str())
}
