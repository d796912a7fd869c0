//! JavaScript rewriting: frame-bust neutralization and WebSocket routing

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

use super::shim::websocket_constructor;
use super::RewriteContext;

// The regex crate has no lookbehind; group 1 captures the preceding byte so
// member accesses like `foo.top.location` are left alone.
static FRAME_CHECK_RE: Lazy<Regex> = Lazy::new(|| {
    let operand = r"(?:(?:window|self)\.)?(?:top|parent|self|window)(?:\.location(?:\.href)?)?|(?:document\.)?location(?:\.href)?";
    Regex::new(&format!(
        r"\bif\s*\(\s*({op})\s*(!==?|===?)\s*({op})\s*\)",
        op = operand
    ))
    .expect("frame check pattern")
});

static FRAME_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w$.])(?:(?:window|self)\.)?(?:top|parent)\.location(?:\.href)?\s*=([^=]|$)")
        .expect("frame assignment pattern")
});

static FRAME_NAVIGATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w$.])(?:(?:window|self)\.)?(?:top|parent)\.location\.(?:replace|assign)\s*\(")
        .expect("frame navigation pattern")
});

static NEW_WEBSOCKET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w$.])new\s+(?:(?:window|self|globalThis)\.)?WebSocket\s*\(")
        .expect("websocket pattern")
});

fn targets_frame(operand: &[u8]) -> bool {
    operand
        .split(|&b| b == b'.')
        .any(|segment| segment == b"top" || segment == b"parent")
}

/// Disarm scripts that try to break out of an enclosing frame
///
/// Frame checks comparing `top`/`parent` against the current window are
/// pinned to the "not framed" outcome, and navigations of the top or parent
/// window are redirected into a harmless property write.
pub fn neutralize_frame_busting(source: &[u8]) -> Vec<u8> {
    let pass = FRAME_CHECK_RE.replace_all(source, |caps: &Captures| {
        let left = &caps[1];
        let right = &caps[3];
        if left == right || !(targets_frame(left) || targets_frame(right)) {
            return caps[0].to_vec();
        }
        if caps[2].starts_with(b"!") {
            b"if (false)".to_vec()
        } else {
            b"if (true)".to_vec()
        }
    });

    let pass = FRAME_ASSIGN_RE.replace_all(&pass, |caps: &Captures| {
        let mut out = caps[1].to_vec();
        out.extend_from_slice(b"self.__bareFrameBust=");
        out.extend_from_slice(&caps[2]);
        out
    });

    FRAME_NAVIGATE_RE
        .replace_all(&pass, |caps: &Captures| {
            let mut out = caps[1].to_vec();
            out.extend_from_slice(b"self.__bareFrameBust=(");
            out
        })
        .into_owned()
}

/// Route `new WebSocket(...)` through the proxy's WebSocket endpoint
pub fn route_websockets(source: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let constructor = websocket_constructor(ctx);
    NEW_WEBSOCKET_RE
        .replace_all(source, |caps: &Captures| {
            let mut out = caps[1].to_vec();
            out.extend_from_slice(b"new ");
            out.extend_from_slice(constructor.as_bytes());
            out.push(b'(');
            out
        })
        .into_owned()
}

/// Rewrite a standalone or inline script
pub fn rewrite_js(source: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    route_websockets(&neutralize_frame_busting(source), ctx)
}
