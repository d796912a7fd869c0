//! Content-Encoding decoding for rewritable bodies

use std::borrow::Cow;
use std::io::Read;

use crate::error::{BareError, Result};

/// Codings the rewriter can undo, in the order advertised upstream
pub const SUPPORTED_CODINGS: &[&str] = &["gzip", "deflate", "br"];

/// Undo every coding listed in `Content-Encoding`
///
/// Codings are removed in reverse order of application. Output larger than
/// `limit` bytes is an error so a small compressed body cannot expand without
/// bound.
pub fn decode<'a>(body: &'a [u8], content_encoding: Option<&str>, limit: usize) -> Result<Cow<'a, [u8]>> {
    let codings: Vec<String> = content_encoding
        .unwrap_or_default()
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty() && c != "identity")
        .collect();

    let mut current: Cow<'a, [u8]> = Cow::Borrowed(body);
    for coding in codings.iter().rev() {
        current = Cow::Owned(decode_one(&current, coding, limit)?);
    }
    Ok(current)
}

/// Whether a single coding token can be decoded
pub fn is_supported(coding: &str) -> bool {
    let coding = coding.trim().to_ascii_lowercase();
    coding == "identity" || coding == "x-gzip" || SUPPORTED_CODINGS.contains(&coding.as_str())
}

fn decode_one(body: &[u8], coding: &str, limit: usize) -> Result<Vec<u8>> {
    match coding {
        "gzip" | "x-gzip" => read_limited(flate2::read::MultiGzDecoder::new(body), limit, coding),
        // Servers disagree on whether deflate means zlib-wrapped or raw.
        "deflate" => read_limited(flate2::read::ZlibDecoder::new(body), limit, coding)
            .or_else(|_| read_limited(flate2::read::DeflateDecoder::new(body), limit, coding)),
        "br" => read_limited(brotli::Decompressor::new(body, 4096), limit, coding),
        other => Err(BareError::Rewrite(format!(
            "unsupported content encoding: {}",
            other
        ))),
    }
}

fn read_limited<R: Read>(reader: R, limit: usize, coding: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| BareError::Rewrite(format!("{} decode failed: {}", coding, e)))?;

    if out.len() > limit {
        return Err(BareError::Rewrite(format!(
            "{} body expands beyond {} bytes",
            coding, limit
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    const TEXT: &[u8] = b"<html><head></head><body>hello</body></html>";

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn test_identity_borrows() {
        let out = decode(TEXT, None, 1024).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        let out = decode(TEXT, Some("identity"), 1024).unwrap();
        assert_eq!(&*out, TEXT);
    }

    #[test]
    fn test_gzip() {
        assert_eq!(&*decode(&gzip(TEXT), Some("gzip"), 1024).unwrap(), TEXT);
    }

    #[test]
    fn test_deflate_zlib_and_raw() {
        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(TEXT).unwrap();
        assert_eq!(&*decode(&z.finish().unwrap(), Some("deflate"), 1024).unwrap(), TEXT);

        let mut d = DeflateEncoder::new(Vec::new(), Compression::default());
        d.write_all(TEXT).unwrap();
        assert_eq!(&*decode(&d.finish().unwrap(), Some("deflate"), 1024).unwrap(), TEXT);
    }

    #[test]
    fn test_brotli() {
        let mut compressed = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            w.write_all(TEXT).unwrap();
        }
        assert_eq!(&*decode(&compressed, Some("br"), 1024).unwrap(), TEXT);
    }

    #[test]
    fn test_stacked_codings_decode_in_reverse() {
        let mut d = DeflateEncoder::new(Vec::new(), Compression::default());
        d.write_all(&gzip(TEXT)).unwrap();
        let twice = d.finish().unwrap();
        assert_eq!(&*decode(&twice, Some("gzip, deflate"), 1024).unwrap(), TEXT);
    }

    #[test]
    fn test_expansion_limit() {
        let big = vec![b'a'; 100_000];
        let err = decode(&gzip(&big), Some("gzip"), 1000).unwrap_err();
        assert!(matches!(err, BareError::Rewrite(_)));
    }

    #[test]
    fn test_unknown_coding_is_error() {
        assert!(decode(TEXT, Some("zstd"), 1024).is_err());
        assert!(!is_supported("zstd"));
        assert!(is_supported("br"));
    }
}
