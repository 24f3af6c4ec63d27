//! Request-path percent-decoding and normalization.
//!
//! Turns a raw, possibly percent-encoded request path into a sequence of
//! validated path segments that are guaranteed not to escape whatever root
//! they are later joined to. See [`normalize`].

use memchr::memchr;
use percent_encoding::percent_decode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathError {
    /// A `%` was not followed by two hex digits.
    MalformedEscape,
    /// The decoded path contained a NUL byte.
    NulByte,
    /// A decoded segment contains whitespace, a control character, or one
    /// of `< > " ^`.
    InvalidChar,
    /// A `..` segment tried to climb above the root.
    Traversal,
    /// The path was not valid UTF-8 after decoding.
    NotUtf8,
    /// A segment decoded to contain `/` (i.e. arrived as `%2F`), which would
    /// otherwise let an escaped separator re-introduce `..` after the
    /// per-segment traversal check has already run.
    EncodedSeparator,
}

/// Normalizes a raw request path into a root-relative, slash-separated
/// string with no `.`/`..` segments, no repeated slashes, and no
/// percent-escapes remaining.
///
/// Returns `"/"` for a path that resolves to the root. Rejects anything
/// that would need to climb above the root to resolve, matching spec
/// invariant: "the normalized request path never escapes the configured
/// document root."
pub(crate) fn normalize(path: &[u8]) -> Result<String, PathError> {
    let mut segments: Vec<Vec<u8>> = Vec::new();

    for raw in path.split(|&b| b == b'/') {
        if raw.is_empty() {
            continue;
        }

        let decoded = decode_segment(raw)?;
        match decoded.as_slice() {
            b"." => continue,
            b".." => {
                segments.pop().ok_or(PathError::Traversal)?;
            }
            seg => {
                if seg.iter().any(is_disallowed) {
                    return Err(PathError::InvalidChar);
                }
                segments.push(seg.to_vec());
            }
        }
    }

    let mut out = String::with_capacity(path.len());
    if segments.is_empty() {
        out.push('/');
        return Ok(out);
    }

    for seg in &segments {
        out.push('/');
        out.push_str(std::str::from_utf8(seg).map_err(|_| PathError::NotUtf8)?);
    }

    Ok(out)
}

#[inline]
fn is_disallowed(&b: &u8) -> bool {
    matches!(b, 0x00..=0x1F | 0x7F | b' ' | b'<' | b'>' | b'"' | b'^')
}

fn decode_segment(raw: &[u8]) -> Result<Vec<u8>, PathError> {
    let mut i = 0;
    while let Some(pos) = memchr(b'%', &raw[i..]) {
        let at = i + pos;
        match raw.get(at + 1..at + 3) {
            Some(hex) if hex.iter().all(u8::is_ascii_hexdigit) => i = at + 3,
            _ => return Err(PathError::MalformedEscape),
        }
    }

    let decoded: Vec<u8> = percent_decode(raw).collect();
    if memchr(0, &decoded).is_some() {
        return Err(PathError::NulByte);
    }
    // An escaped `%2F` decoding back into a literal separator would let a
    // single raw segment (already past the per-segment `..` check) smuggle
    // a `/../` sequence into the output untouched.
    if memchr(b'/', &decoded).is_some() {
        return Err(PathError::EncodedSeparator);
    }

    Ok(decoded)
}

/// Returns the final path segment (after the last `/`), used to derive a
/// safe on-disk filename for uploads. Never contains `/` or NUL; empty
/// input yields `None`.
pub(crate) fn sanitize_filename(raw: &[u8]) -> Option<String> {
    let name = match memchr::memrchr(b'/', raw) {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };

    let decoded = decode_segment(name).ok()?;
    if decoded.is_empty() || decoded == b"." || decoded == b".." {
        return None;
    }

    std::str::from_utf8(&decoded).ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root() {
        assert_eq!(normalize(b"/").unwrap(), "/");
        assert_eq!(normalize(b"").unwrap(), "/");
    }

    #[test]
    fn collapses_slashes_and_dot() {
        assert_eq!(normalize(b"/a//b/./c").unwrap(), "/a/b/c");
    }

    #[test]
    fn resolves_dotdot() {
        assert_eq!(normalize(b"/a/b/../c").unwrap(), "/a/c");
    }

    #[test]
    fn rejects_traversal_above_root() {
        assert_eq!(normalize(b"/../../etc/passwd"), Err(PathError::Traversal));
        assert_eq!(normalize(b"/a/../../b"), Err(PathError::Traversal));
    }

    #[test]
    fn decodes_percent_escapes() {
        assert_eq!(normalize(b"/a%41b/c").unwrap(), "/aAb/c");
    }

    #[test]
    fn rejects_encoded_separator() {
        assert_eq!(normalize(b"/a%2Fb/c"), Err(PathError::EncodedSeparator));
        assert_eq!(normalize(b"/safe%2F..%2Fetc/passwd"), Err(PathError::EncodedSeparator));
    }

    #[test]
    fn rejects_decoded_whitespace() {
        assert_eq!(normalize(b"/hello%20world"), Err(PathError::InvalidChar));
    }

    #[test]
    fn rejects_malformed_escape() {
        assert_eq!(normalize(b"/a%2"), Err(PathError::MalformedEscape));
        assert_eq!(normalize(b"/a%zz"), Err(PathError::MalformedEscape));
    }

    #[test]
    fn rejects_nul_byte() {
        assert_eq!(normalize(b"/a%00b"), Err(PathError::NulByte));
    }

    #[test]
    fn rejects_control_and_whitespace() {
        assert_eq!(normalize(b"/a b"), Err(PathError::InvalidChar));
        assert_eq!(normalize(b"/a<b>"), Err(PathError::InvalidChar));
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename(b"a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_filename(b"../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename(b"dir/../a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_filename(b""), None);
    }
}
