//! Static file serving: conditional requests, ranges, and pre-compressed
//! variant negotiation (C8).

use crate::host::mime;
use crate::host::route::CachePolicy;
use crate::{Handled, Method, Request, Response, StatusCode, Version};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

struct Resolved {
    disk_path: PathBuf,
    content_type: &'static str,
    content_encoding: Option<&'static str>,
}

/// Resolves `rel_path` (URL-decoded, no leading `/`, `""` for the route
/// root) against `document_root`, applying the index filename for
/// directory requests and selecting a pre-compressed sibling when the
/// client accepts one and `compress` is enabled.
///
/// Returns `None` when dotfile access is attempted and disallowed; the
/// caller treats that identically to a missing file (404), matching the
/// resolved Open Question that dotfiles are invisible rather than
/// forbidden.
fn resolve(document_root: &Path, rel_path: &str, index: &str, allow_dotfiles: bool) -> Option<PathBuf> {
    if !allow_dotfiles && rel_path.split('/').any(|seg| seg.starts_with('.')) {
        return None;
    }

    let mut disk_path = document_root.to_path_buf();
    if rel_path.is_empty() || rel_path.ends_with('/') {
        disk_path.push(rel_path);
        disk_path.push(index);
    } else {
        disk_path.push(rel_path);
    }

    Some(disk_path)
}

/// Picks the best pre-compressed sibling (`.br` over `.gzip`) the client
/// accepts with nonzero quality, falling back to the original file.
async fn pick_variant(path: &Path, accept_encoding: Option<&[u8]>) -> (PathBuf, Option<&'static str>) {
    let Some(accept) = accept_encoding.and_then(|v| std::str::from_utf8(v).ok()) else {
        return (path.to_path_buf(), None);
    };

    for (ext, token) in [("br", "br"), ("gz", "gzip")] {
        if accepts(accept, token) {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(".");
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            if fs::metadata(&candidate).await.is_ok() {
                return (candidate, Some(token));
            }
        }
    }

    (path.to_path_buf(), None)
}

/// Checks whether `accept-encoding` grants a nonzero `q` to `token`.
fn accepts(accept_encoding: &str, token: &str) -> bool {
    for entry in accept_encoding.split(',') {
        let mut parts = entry.trim().split(';');
        let Some(name) = parts.next() else { continue };
        if !name.trim().eq_ignore_ascii_case(token) {
            continue;
        }
        let q: f32 = parts
            .next()
            .and_then(|p| p.trim().strip_prefix("q="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);
        return q > 0.0;
    }
    false
}

fn etag(modified: SystemTime, len: u64) -> String {
    let secs = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{secs:x}-{len:x}\"")
}

/// Evaluates the RFC 7232 conditional-request chain in its mandated order:
/// `If-Match` -> `If-Unmodified-Since` -> `If-None-Match` -> `If-Modified-Since`.
/// Returns `Some(status)` when the chain short-circuits the request.
fn check_conditionals(request: &Request, etag: &str, modified: SystemTime) -> Option<StatusCode> {
    let is_safe = matches!(request.method(), Method::Get | Method::Head);

    if let Some(value) = request.header(b"if-match") {
        let Some(candidates) = parse_etag_list(value) else {
            return Some(StatusCode::BadRequest);
        };
        if !if_match_satisfied(&candidates, etag) {
            return Some(StatusCode::PreconditionFailed);
        }
    } else if let Some(value) = request.header(b"if-unmodified-since") {
        if let Some(since) = parse_http_date(value) {
            if modified > since {
                return Some(StatusCode::PreconditionFailed);
            }
        }
    }

    if let Some(value) = request.header(b"if-none-match") {
        let Some(candidates) = parse_etag_list(value) else {
            return Some(StatusCode::BadRequest);
        };
        if if_match_satisfied(&candidates, etag) {
            return Some(if is_safe { StatusCode::NotModified } else { StatusCode::PreconditionFailed });
        }
    } else if is_safe {
        if let Some(value) = request.header(b"if-modified-since") {
            if let Some(since) = parse_http_date(value) {
                if modified <= since {
                    return Some(StatusCode::NotModified);
                }
            }
        }
    }

    None
}

/// Splits an `If-Match`/`If-None-Match` header into its comma-separated
/// entries, validating each as `*` or a well-formed ETag token (an optional
/// `W/` weak-validator prefix followed by a quoted string with no embedded
/// quotes or control characters). Returns `None` if any entry is malformed.
fn parse_etag_list(header: &[u8]) -> Option<Vec<&str>> {
    let header = std::str::from_utf8(header).ok()?;
    if header.trim() == "*" {
        return Some(vec!["*"]);
    }
    header
        .split(',')
        .map(|candidate| {
            let candidate = candidate.trim();
            let quoted = candidate.strip_prefix("W/").unwrap_or(candidate);
            if quoted.len() < 2 || !quoted.starts_with('"') || !quoted.ends_with('"') {
                return None;
            }
            let inner = &quoted[1..quoted.len() - 1];
            if inner.bytes().any(|b| b == b'"' || b < 0x20) {
                return None;
            }
            Some(candidate)
        })
        .collect()
}

fn if_match_satisfied(candidates: &[&str], etag: &str) -> bool {
    candidates.iter().any(|&c| c == "*" || c.trim_start_matches("W/") == etag)
}

fn parse_http_date(value: &[u8]) -> Option<SystemTime> {
    httpdate::parse_http_date(std::str::from_utf8(value).ok()?).ok()
}

#[derive(Debug, PartialEq)]
struct ByteRange {
    start: u64,
    end: u64, // inclusive
}

/// Parses a `Range: bytes=a-b,c-d` header against a known resource length.
/// Returns `None` if the header is absent or unparsable (served in full);
/// `Some(Err(()))` if every requested range is unsatisfiable (416);
/// otherwise the satisfiable ranges in request order.
fn parse_range(header: &[u8], len: u64) -> Option<Result<Vec<ByteRange>, ()>> {
    let header = std::str::from_utf8(header).ok()?;
    let spec = header.strip_prefix("bytes=")?;

    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (start_s, end_s) = part.split_once('-')?;

        let range = if start_s.is_empty() {
            // suffix range: last N bytes
            let suffix_len: u64 = end_s.parse().ok()?;
            if suffix_len == 0 || len == 0 {
                continue;
            }
            let suffix_len = suffix_len.min(len);
            ByteRange { start: len - suffix_len, end: len - 1 }
        } else {
            let start: u64 = start_s.parse().ok()?;
            if start >= len {
                continue;
            }
            let end: u64 = if end_s.is_empty() {
                len - 1
            } else {
                end_s.parse::<u64>().ok()?.min(len - 1)
            };
            if end < start {
                continue;
            }
            ByteRange { start, end }
        };
        ranges.push(range);
    }

    if ranges.is_empty() {
        Some(Err(()))
    } else {
        Some(Ok(ranges))
    }
}

/// Applies the route's cache policy and, when pre-compression variant
/// negotiation is enabled, the `Vary: Accept-Encoding` header that tells
/// caches the response depends on the client's `Accept-Encoding`. Applied
/// regardless of status code, on every response path `serve` returns.
fn apply_response_headers(response: &mut Response, cache: Option<CachePolicy>, compress: bool, version: Version) {
    if compress {
        response.header("vary", "accept-encoding");
    }
    if let Some(policy) = cache {
        response.header("cache-control", policy.header_value());
        if policy.is_no_cache() && version == Version::Http10 {
            response.header("pragma", "no-cache");
            response.header("expires", "0");
        }
    }
}

/// Serves a static file for a matched File route.
///
/// `rel_path` is the already-normalized, percent-decoded, traversal-checked
/// remainder after the route's prefix has been stripped (see
/// [`crate::host::path::normalize`]), with no leading slash (`""` selects
/// `document_root` itself, via the index file). Callers must never pass the
/// raw, still-encoded request path here: resolving against anything other
/// than the normalized path would defeat the document-root containment
/// invariant.
pub(crate) async fn serve(
    request: &Request,
    response: &mut Response,
    document_root: &Path,
    rel_path: &str,
    index: &str,
    allow_dotfiles: bool,
    compress: bool,
    cache: Option<CachePolicy>,
) -> Handled {
    let Some(base_path) = resolve(document_root, rel_path, index, allow_dotfiles) else {
        apply_response_headers(response, cache, compress, request.version());
        return response.status(StatusCode::NotFound).body("Not Found");
    };

    let metadata = match fs::metadata(&base_path).await {
        Ok(m) if m.is_dir() => {
            if !request.url().path().ends_with(b"/") {
                let mut location = String::from_utf8_lossy(request.url().path()).into_owned();
                location.push('/');
                apply_response_headers(response, cache, compress, request.version());
                return response.status(StatusCode::MovedPermanently).header("location", location).body("");
            }
            match fs::metadata(base_path.join(index)).await {
                Ok(m) => m,
                Err(_) => {
                    apply_response_headers(response, cache, compress, request.version());
                    return response.status(StatusCode::NotFound).body("Not Found");
                }
            }
        }
        Ok(m) => m,
        Err(_) => {
            apply_response_headers(response, cache, compress, request.version());
            return response.status(StatusCode::NotFound).body("Not Found");
        }
    };

    let ext = base_path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let content_type = mime::lookup(ext);

    let (serve_path, content_encoding) = if compress {
        pick_variant(&base_path, request.header(b"accept-encoding")).await
    } else {
        (base_path.clone(), None)
    };

    let serve_meta = if serve_path == base_path {
        metadata
    } else {
        match fs::metadata(&serve_path).await {
            Ok(m) => m,
            Err(_) => return response.status(StatusCode::NotFound).body("Not Found"),
        }
    };

    let modified = serve_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let len = serve_meta.len();
    let tag = etag(modified, len);

    if let Some(status) = check_conditionals(request, &tag, modified) {
        response.status(status);
        if status != StatusCode::BadRequest {
            response.header("etag", tag.clone()).header("last-modified", httpdate::fmt_http_date(modified));
        }
        apply_response_headers(response, cache, compress, request.version());
        return response.body("");
    }

    if request.method() == Method::Head {
        response
            .status(StatusCode::Ok)
            .header("content-type", content_type)
            .header("etag", tag)
            .header("last-modified", httpdate::fmt_http_date(modified))
            .header("accept-ranges", "bytes");
        if let Some(enc) = content_encoding {
            response.header("content-encoding", enc);
        }
        apply_response_headers(response, cache, compress, request.version());
        return response.body_head(len as usize);
    }

    let range_applies = request
        .header(b"if-range")
        .map(|v| if_range_matches(v, &tag, modified))
        .unwrap_or(true);

    let range = if range_applies { request.header(b"range").and_then(|h| parse_range(h, len)) } else { None };

    let data = match fs::read(&serve_path).await {
        Ok(d) => d,
        Err(_) => return response.status(StatusCode::InternalServerError).body("Internal Server Error"),
    };

    match range {
        None => {
            response
                .status(StatusCode::Ok)
                .header("content-type", content_type)
                .header("etag", tag)
                .header("last-modified", httpdate::fmt_http_date(modified))
                .header("accept-ranges", "bytes");
            if let Some(enc) = content_encoding {
                response.header("content-encoding", enc);
            }
            apply_response_headers(response, cache, compress, request.version());
            response.body(data)
        }
        Some(Err(())) => {
            response.status(StatusCode::RangeNotSatisfiable).header("content-range", format!("bytes */{len}"));
            apply_response_headers(response, cache, compress, request.version());
            response.body("")
        }
        Some(Ok(ranges)) if ranges.len() == 1 => {
            let r = &ranges[0];
            let slice = &data[r.start as usize..=r.end as usize];
            response
                .status(StatusCode::PartialContent)
                .header("content-type", content_type)
                .header("content-range", format!("bytes {}-{}/{len}", r.start, r.end))
                .header("etag", tag)
                .header("accept-ranges", "bytes");
            apply_response_headers(response, cache, compress, request.version());
            response.body(slice)
        }
        Some(Ok(ranges)) => {
            let boundary = "EMBEDWEB_BYTERANGE";
            response
                .status(StatusCode::PartialContent)
                .header("content-type", format!("multipart/byteranges; boundary={boundary}"))
                .header("etag", tag)
                .header("accept-ranges", "bytes");
            apply_response_headers(response, cache, compress, request.version());
            response.body_with(|writer| {
                for r in &ranges {
                    writer.write(format!("--{boundary}\r\n"));
                    writer.write(format!("content-type: {content_type}\r\n"));
                    writer.write(format!("content-range: bytes {}-{}/{len}\r\n\r\n", r.start, r.end));
                    writer.write(&data[r.start as usize..=r.end as usize]);
                    writer.write("\r\n");
                }
                writer.write(format!("--{boundary}--\r\n"));
            })
        }
    }
}

fn if_range_matches(value: &[u8], etag: &str, modified: SystemTime) -> bool {
    if let Some(since) = parse_http_date(value) {
        return modified <= since;
    }
    std::str::from_utf8(value)
        .map(|v| v.trim().trim_start_matches("W/") == etag)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_encoding_quality() {
        assert!(accepts("br;q=1.0, gzip;q=0.8", "br"));
        assert!(accepts("gzip", "gzip"));
        assert!(!accepts("br;q=0", "br"));
        assert!(!accepts("deflate", "br"));
    }

    #[test]
    fn range_single() {
        match parse_range(b"bytes=0-499", 1000) {
            Some(Ok(ranges)) => {
                assert_eq!(ranges.len(), 1);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[0].end, 499);
            }
            _ => panic!("expected a satisfiable single range"),
        }
    }

    #[test]
    fn range_suffix() {
        match parse_range(b"bytes=-500", 1000) {
            Some(Ok(ranges)) => {
                assert_eq!(ranges[0].start, 500);
                assert_eq!(ranges[0].end, 999);
            }
            _ => panic!("expected satisfiable suffix range"),
        }
    }

    #[test]
    fn range_out_of_bounds_is_unsatisfiable() {
        assert_eq!(parse_range(b"bytes=5000-6000", 1000), Some(Err(())));
    }

    #[test]
    fn range_multi() {
        match parse_range(b"bytes=0-99,200-299", 1000) {
            Some(Ok(ranges)) => assert_eq!(ranges.len(), 2),
            _ => panic!("expected two ranges"),
        }
    }

    #[test]
    fn etag_is_deterministic() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        assert_eq!(etag(t, 500), etag(t, 500));
        assert_ne!(etag(t, 500), etag(t, 501));
    }

    #[test]
    fn etag_list_accepts_star_and_quoted_tokens() {
        assert_eq!(parse_etag_list(b"*"), Some(vec!["*"]));
        assert_eq!(parse_etag_list(br#""abc""#), Some(vec![r#""abc""#]));
        assert_eq!(parse_etag_list(br#""abc", W/"def""#), Some(vec![r#""abc""#, r#"W/"def""#]));
    }

    #[test]
    fn etag_list_rejects_malformed_tokens() {
        assert_eq!(parse_etag_list(b"abc"), None);
        assert_eq!(parse_etag_list(br#""abc"#), None);
        assert_eq!(parse_etag_list(br#""ab"c""#), None);
    }

    #[test]
    fn if_match_star_satisfies_any_etag() {
        assert!(if_match_satisfied(&["*"], r#""xyz""#));
    }

    #[test]
    fn if_match_weak_prefix_ignored_in_comparison() {
        assert!(if_match_satisfied(&[r#"W/"abc""#], r#""abc""#));
        assert!(!if_match_satisfied(&[r#""abc""#], r#""def""#));
    }
}
