//! Streaming `multipart/form-data` parsing for the upload subsystem (C10).

use memchr::memmem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MultipartError {
    /// `Content-Type` had no `boundary=` parameter.
    MissingBoundary,
    /// A part had no `Content-Disposition` header.
    MissingDisposition,
    /// A part's `Content-Disposition` had no `filename=` or `name=`.
    MissingName,
    /// The body ended before the closing boundary was found.
    Truncated,
}

pub(crate) struct Part<'a> {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<&'a str>,
    pub(crate) data: &'a [u8],
}

/// Extracts the `boundary` parameter from a `Content-Type: multipart/form-data; boundary=...`
/// header value.
pub(crate) fn boundary(content_type: &[u8]) -> Result<&str, MultipartError> {
    let content_type = std::str::from_utf8(content_type).map_err(|_| MultipartError::MissingBoundary)?;
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            return Ok(value.trim_matches('"'));
        }
    }
    Err(MultipartError::MissingBoundary)
}

/// Splits a `multipart/form-data` body into its parts.
///
/// Each part's `Content-Disposition` header is parsed for `name` (required)
/// and `filename` (present for file fields). Parts without a disposition
/// header are rejected rather than silently skipped.
pub(crate) fn parse<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>, MultipartError> {
    let delim = format!("--{boundary}");
    let delim = delim.as_bytes();

    let mut parts = Vec::new();
    let mut pos = match memmem::find(body, delim) {
        Some(p) => p + delim.len(),
        None => return Err(MultipartError::Truncated),
    };

    loop {
        // After a boundary line comes either `--` (final boundary) or CRLF.
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        pos += skip_crlf(&body[pos..]);

        let header_end = memmem::find(&body[pos..], b"\r\n\r\n").ok_or(MultipartError::Truncated)?;
        let header_block = &body[pos..pos + header_end];
        pos += header_end + 4;

        let next = memmem::find(&body[pos..], delim).ok_or(MultipartError::Truncated)?;
        // The two bytes before the next boundary are the part's trailing CRLF.
        let data_end = next.saturating_sub(2);
        let data = &body[pos..pos + data_end];

        let (name, filename, content_type) = parse_headers(header_block)?;
        parts.push(Part { name, filename, content_type, data });

        pos += next + delim.len();
    }
}

fn skip_crlf(s: &[u8]) -> usize {
    if s.starts_with(b"\r\n") {
        2
    } else {
        0
    }
}

fn parse_headers(block: &[u8]) -> Result<(String, Option<String>, Option<&str>), MultipartError> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in block.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("").trim();
        if let Some(rest) = line
            .to_ascii_lowercase()
            .strip_prefix("content-disposition:")
            .map(|_| &line[line.find(':').unwrap() + 1..])
        {
            for param in rest.split(';').skip(1) {
                let param = param.trim();
                if let Some(v) = param.strip_prefix("name=") {
                    name = Some(v.trim_matches('"').to_owned());
                } else if let Some(v) = param.strip_prefix("filename=") {
                    filename = Some(v.trim_matches('"').to_owned());
                }
            }
        } else if line.to_ascii_lowercase().starts_with("content-type:") {
            content_type = Some(line[line.find(':').unwrap() + 1..].trim());
        }
    }

    let name = name.ok_or(MultipartError::MissingDisposition)?;
    if name.is_empty() {
        return Err(MultipartError::MissingName);
    }
    Ok((name, filename, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"------B\r\n\
Content-Disposition: form-data; name=\"field\"\r\n\
\r\n\
value\r\n\
------B\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello world\r\n\
------B--";

    #[test]
    fn extracts_boundary() {
        assert_eq!(boundary(b"multipart/form-data; boundary=----B").unwrap(), "----B");
    }

    #[test]
    fn parses_two_parts() {
        let parts = parse(BODY, "----B").unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name, "field");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"value");

        assert_eq!(parts[1].name, "file");
        assert_eq!(parts[1].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[1].content_type, Some("text/plain"));
        assert_eq!(parts[1].data, b"hello world");
    }

    #[test]
    fn rejects_missing_boundary() {
        assert_eq!(
            boundary(b"multipart/form-data"),
            Err(MultipartError::MissingBoundary)
        );
    }

    #[test]
    fn rejects_truncated_body() {
        assert_eq!(parse(b"not multipart at all", "X"), Err(MultipartError::Truncated));
    }
}
