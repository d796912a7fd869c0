//! CSS rewriting: `url(...)` references and `@import` targets

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

use super::RewriteContext;

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).expect("css url pattern")
});

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("css import pattern")
});

fn first_group<'a>(caps: &Captures<'a>) -> Option<&'a [u8]> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_bytes())
}

fn rewrite_reference(caps: &Captures, ctx: &RewriteContext) -> Option<String> {
    let raw = std::str::from_utf8(first_group(caps)?).ok()?;
    ctx.rewrite_url(raw)
}

/// Rewrite every URL a stylesheet references
pub fn rewrite_css(source: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let pass = URL_RE.replace_all(source, |caps: &Captures| match rewrite_reference(caps, ctx) {
        Some(url) => format!("url(\"{}\")", url).into_bytes(),
        None => caps[0].to_vec(),
    });

    IMPORT_RE
        .replace_all(&pass, |caps: &Captures| match rewrite_reference(caps, ctx) {
            Some(url) => format!("@import \"{}\"", url).into_bytes(),
            None => caps[0].to_vec(),
        })
        .into_owned()
}
