//! HTML rewriting
//!
//! The document is split around `<script>` and `<style>` blocks so that
//! attribute patterns only ever run over markup, inline scripts go through
//! the JavaScript rewriter and style blocks through the CSS rewriter.

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use url::Url;

use super::{css, js, shim, ContentKind, RewriteContext};

static SCRIPT_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(<script\b[^>]*>)(.*?)(</script\s*>)").expect("script block pattern")
});

static STYLE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(<style\b[^>]*>)(.*?)(</style\s*>)").expect("style block pattern")
});

static URL_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(\s(?:href|src|action|formaction|poster|data|background)\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
    )
    .expect("url attribute pattern")
});

static SRCSET_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s(?:srcset|imagesrcset)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("srcset attribute pattern")
});

static STYLE_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\sstyle\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).expect("style attribute pattern")
});

static SCRIPT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\stype\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).expect("script type pattern")
});

static BASE_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<base\b[^>]*?\shref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("base href pattern")
});

static BASE_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<base\b[^>]*>").expect("base tag pattern"));

static HEAD_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("head pattern"));

static HTML_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<html(?:\s[^>]*)?>").expect("html pattern"));

static DOCTYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*<!doctype[^>]*>").expect("doctype pattern"));

/// Rewrite an HTML document and inject the client shim
pub fn rewrite_html(source: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let ctx = document_context(source, ctx);

    let body = split_blocks(
        source,
        &SCRIPT_BLOCK_RE,
        |markup| rewrite_markup(markup, &ctx),
        |caps| {
            let mut out = rewrite_attributes(&caps[1], &ctx);
            if is_javascript(&caps[1]) {
                out.extend(js::rewrite_js(&caps[2], &ctx));
            } else {
                out.extend_from_slice(&caps[2]);
            }
            out.extend_from_slice(&caps[3]);
            out
        },
    );

    inject_shim(body, &ctx)
}

/// Honor a `<base href>` when resolving relative URLs
fn document_context(source: &[u8], ctx: &RewriteContext) -> RewriteContext {
    BASE_HREF_RE
        .captures(source)
        .and_then(|caps| first_group(&caps).map(|v| v.to_vec()))
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|raw| ctx.base_url().join(raw.trim()).ok())
        .filter(|base: &Url| matches!(base.scheme(), "http" | "https"))
        .map(|base| ctx.with_base(base))
        .unwrap_or_else(|| ctx.clone())
}

/// Apply `outside` to the text between matches of `re` and `block` to each match
fn split_blocks<F, G>(source: &[u8], re: &Regex, mut outside: F, mut block: G) -> Vec<u8>
where
    F: FnMut(&[u8]) -> Vec<u8>,
    G: FnMut(&Captures) -> Vec<u8>,
{
    let mut out = Vec::with_capacity(source.len() + source.len() / 8);
    let mut last = 0;

    for caps in re.captures_iter(source) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.extend(outside(&source[last..whole.start()]));
        out.extend(block(&caps));
        last = whole.end();
    }

    out.extend(outside(&source[last..]));
    out
}

fn rewrite_markup(markup: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    split_blocks(
        markup,
        &STYLE_BLOCK_RE,
        |text| rewrite_attributes(text, ctx),
        |caps| {
            let mut out = rewrite_attributes(&caps[1], ctx);
            out.extend(css::rewrite_css(&caps[2], ctx));
            out.extend_from_slice(&caps[3]);
            out
        },
    )
}

/// `<base>` tags pass through untouched; resolution already honors them.
fn rewrite_attributes(markup: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    split_blocks(
        markup,
        &BASE_TAG_RE,
        |text| rewrite_tag_attributes(text, ctx),
        |caps| caps[0].to_vec(),
    )
}

fn rewrite_tag_attributes(markup: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let pass = STYLE_ATTR_RE.replace_all(markup, |caps: &Captures| rewrite_style_attr(caps, ctx));

    let pass = SRCSET_ATTR_RE.replace_all(&pass, |caps: &Captures| {
        let Some((value, quote)) = quoted_value(caps) else {
            return caps[0].to_vec();
        };
        match std::str::from_utf8(value) {
            Ok(value) => attribute(&caps[1], quote, &rewrite_srcset(value, ctx)),
            Err(_) => caps[0].to_vec(),
        }
    });

    URL_ATTR_RE
        .replace_all(&pass, |caps: &Captures| {
            let Some((value, quote)) = quoted_value(caps) else {
                return caps[0].to_vec();
            };
            std::str::from_utf8(value)
                .ok()
                .and_then(|value| ctx.rewrite_url(value))
                .map(|url| attribute(&caps[1], quote, &url))
                .unwrap_or_else(|| caps[0].to_vec())
        })
        .into_owned()
}

fn rewrite_style_attr(caps: &Captures, ctx: &RewriteContext) -> Vec<u8> {
    let Some((value, quote)) = quoted_value(caps) else {
        return caps[0].to_vec();
    };
    let Ok(value) = std::str::from_utf8(value) else {
        return caps[0].to_vec();
    };

    let decoded = value.replace("&quot;", "\"");
    let rewritten = String::from_utf8_lossy(&css::rewrite_css(decoded.as_bytes(), ctx)).into_owned();
    if rewritten == decoded {
        return caps[0].to_vec();
    }

    let encoded = if quote == b'"' {
        rewritten.replace('"', "&quot;")
    } else {
        rewritten
    };
    attribute(&caps[1], quote, &encoded)
}

/// Rewrite each candidate URL of a `srcset`, keeping its descriptor
fn rewrite_srcset(value: &str, ctx: &RewriteContext) -> String {
    let mut candidates = Vec::new();
    let mut rest = value;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let mut url = &rest[..url_end];
        rest = &rest[url_end..];

        let mut descriptor = "";
        if url.ends_with(',') {
            url = url.trim_end_matches(',');
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            descriptor = rest[..end].trim();
            rest = &rest[end..];
        }

        let rewritten = ctx.rewrite_url(url).unwrap_or_else(|| url.to_string());
        if descriptor.is_empty() {
            candidates.push(rewritten);
        } else {
            candidates.push(format!("{} {}", rewritten, descriptor));
        }
    }

    candidates.join(", ")
}

fn first_group<'h>(caps: &Captures<'h>) -> Option<&'h [u8]> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_bytes())
}

/// Attribute value and the quote it should be written back with
fn quoted_value<'h>(caps: &Captures<'h>) -> Option<(&'h [u8], u8)> {
    if let Some(m) = caps.get(2) {
        return Some((m.as_bytes(), b'"'));
    }
    if let Some(m) = caps.get(3) {
        return Some((m.as_bytes(), b'\''));
    }
    caps.get(4).map(|m| (m.as_bytes(), b'"'))
}

fn attribute(prefix: &[u8], quote: u8, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + value.len() + 2);
    out.extend_from_slice(prefix);
    out.push(quote);
    out.extend_from_slice(value.as_bytes());
    out.push(quote);
    out
}

fn is_javascript(open_tag: &[u8]) -> bool {
    let Some(caps) = SCRIPT_TYPE_RE.captures(open_tag) else {
        return true;
    };
    let declared = first_group(&caps)
        .map(|t| String::from_utf8_lossy(t).trim().to_ascii_lowercase())
        .unwrap_or_default();

    declared.is_empty()
        || declared == "module"
        || ContentKind::from_content_type(&declared) == Some(ContentKind::JavaScript)
}

/// Insert the shim right after `<head>`, synthesizing a head when missing
fn inject_shim(mut html: Vec<u8>, ctx: &RewriteContext) -> Vec<u8> {
    let script = shim::client_script(ctx);

    if let Some(head) = HEAD_OPEN_RE.find(&html) {
        let at = head.end();
        html.splice(at..at, script.into_bytes());
        return html;
    }

    let synthesized = format!("<head>{}</head>", script).into_bytes();
    let at = HTML_OPEN_RE
        .find(&html)
        .or_else(|| DOCTYPE_RE.find(&html))
        .map(|m| m.end())
        .unwrap_or(0);
    html.splice(at..at, synthesized);
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::test_support::{ctx, proxied, PROXY};
    use crate::rewrite::unwrap_proxied_url;

    fn rewrite(src: &str, base: &str) -> String {
        String::from_utf8(rewrite_html(src.as_bytes(), &ctx(base))).unwrap()
    }

    #[test]
    fn test_anchor_rewrite_and_single_shim_after_head() {
        let out = rewrite(
            r#"<html><head><title>t</title></head><body><a href="https://example.com/a">a</a></body></html>"#,
            "https://example.com",
        );

        assert!(out.contains(&format!(
            r#"<a href="{}?url=https%3A%2F%2Fexample.com%2Fa">"#,
            PROXY
        )));
        assert_eq!(out.matches("data-bare-shim").count(), 1);
        assert!(out.starts_with("<html><head><script data-bare-shim>"));
    }

    #[test]
    fn test_absolute_urls_round_trip() {
        let urls = [
            "https://example.com/a?b=c&d=e",
            "http://example.org/path%20with/escapes?x=%2F",
            "https://例え.jp/ü",
        ];
        for url in urls {
            let out = rewrite(&format!(r#"<img src="{}">"#, url), "https://example.com/");
            let start = out.find(PROXY).unwrap();
            let end = out[start..].find('"').unwrap() + start;
            assert_eq!(unwrap_proxied_url(PROXY, &out[start..end]).as_deref(), Some(url));
        }
    }

    #[test]
    fn test_relative_and_protocol_relative() {
        let out = rewrite(
            r#"<link href=/style.css><script src='//cdn.example.net/x.js'></script><form action="submit"></form>"#,
            "https://example.com/dir/page",
        );
        assert!(out.contains(&format!(r#"<link href="{}">"#, proxied("https://example.com/style.css"))));
        assert!(out.contains(&format!("src='{}'", proxied("https://cdn.example.net/x.js"))));
        assert!(out.contains(&format!(
            r#"action="{}""#,
            proxied("https://example.com/dir/submit")
        )));
    }

    #[test]
    fn test_special_urls_untouched() {
        let src = r##"<a href="#top">x</a><a href="javascript:void(0)">y</a><img src="data:image/gif;base64,R0lG"><a href="mailto:a@b.c">m</a>"##;
        let out = rewrite(src, "https://example.com/");
        assert!(out.contains(src));
    }

    #[test]
    fn test_srcset_candidates() {
        let out = rewrite(
            r#"<img srcset="/a.png 1x, /b.png 2x">"#,
            "https://example.com/",
        );
        assert!(out.contains(&format!(
            r#"srcset="{} 1x, {} 2x""#,
            proxied("https://example.com/a.png"),
            proxied("https://example.com/b.png")
        )));
    }

    #[test]
    fn test_style_block_and_attribute() {
        let out = rewrite(
            r#"<style>body{background:url(/bg.png)}</style><div style="background:url(&quot;/d.png&quot;)"></div>"#,
            "https://example.com/",
        );
        assert!(out.contains(&format!(
            r#"<style>body{{background:url("{}")}}</style>"#,
            proxied("https://example.com/bg.png")
        )));
        assert!(out.contains(&format!(
            r#"style="background:url(&quot;{}&quot;)""#,
            proxied("https://example.com/d.png")
        )));
    }

    #[test]
    fn test_inline_frame_busting_is_neutralized() {
        let out = rewrite(
            "<head></head><script>if (top != self) { top.location = self.location; }</script>",
            "https://example.com/",
        );
        assert!(out.contains("<script>if (false) { self.__bareFrameBust= self.location; }</script>"));
    }

    #[test]
    fn test_script_bodies_are_not_attribute_rewritten() {
        let out = rewrite(
            r#"<head></head><script>var src = "/a.png";</script><script type="application/json">{"a": " href=/x"}</script>"#,
            "https://example.com/",
        );
        assert!(out.contains(r#"<script>var src = "/a.png";</script>"#));
        assert!(out.contains(r#"{"a": " href=/x"}"#));
    }

    #[test]
    fn test_base_href_changes_resolution() {
        let out = rewrite(
            r#"<head><base href="https://static.example.com/assets/"></head><img src="logo.png">"#,
            "https://example.com/",
        );
        assert!(out.contains(&proxied("https://static.example.com/assets/logo.png")));
        assert!(out.contains(r#"<base href="https://static.example.com/assets/">"#));
    }

    #[test]
    fn test_relative_base_href_left_in_place() {
        let out = rewrite(
            r#"<html><head><base href="/v2/" target="_blank"><link href="app.css"></head></html>"#,
            "https://example.com/index.html",
        );
        assert!(out.contains(r#"<base href="/v2/" target="_blank">"#));
        assert!(out.contains(&proxied("https://example.com/v2/app.css")));
    }

    #[test]
    fn test_shim_synthesized_without_head() {
        let out = rewrite("<html><body>x</body></html>", "https://example.com/");
        assert!(out.starts_with("<html><head><script data-bare-shim>"));

        let out = rewrite("<!DOCTYPE html><p>x</p>", "https://example.com/");
        assert!(out.starts_with("<!DOCTYPE html><head><script data-bare-shim>"));

        let out = rewrite("<p>x</p>", "https://example.com/");
        assert!(out.starts_with("<head><script data-bare-shim>"));
    }

    #[test]
    fn test_rewrite_is_pure() {
        let src = r#"<html><head></head><a href="/x">x</a><script>new WebSocket("/ws")</script></html>"#;
        assert_eq!(
            rewrite(src, "https://example.com/"),
            rewrite(src, "https://example.com/")
        );
    }

    #[test]
    fn test_header_element_is_not_head() {
        let out = rewrite("<header>h</header><head></head>", "https://example.com/");
        assert!(out.starts_with("<header>h</header><head><script data-bare-shim>"));
    }
}
