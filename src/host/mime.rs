//! Extension-to-MIME-type lookup for the file handler.

macro_rules! mime_table {
    ($($ext:literal => $mime:literal,)*) => {
        /// Returns the MIME type for a file extension (case-insensitive,
        /// without the leading dot). Falls back to
        /// `application/octet-stream` for anything unrecognized.
        pub(crate) fn lookup(ext: &str) -> &'static str {
            let mut buf = [0u8; 16];
            let bytes = ext.as_bytes();
            if bytes.len() > buf.len() {
                return "application/octet-stream";
            }
            for (i, &b) in bytes.iter().enumerate() {
                buf[i] = b.to_ascii_lowercase();
            }

            match &buf[..bytes.len()] {
                $($ext => $mime,)*
                _ => "application/octet-stream",
            }
        }
    };
}

mime_table! {
    b"html" => "text/html; charset=utf-8",
    b"htm" => "text/html; charset=utf-8",
    b"css" => "text/css; charset=utf-8",
    b"js" => "text/javascript; charset=utf-8",
    b"mjs" => "text/javascript; charset=utf-8",
    b"json" => "application/json",
    b"xml" => "application/xml",
    b"txt" => "text/plain; charset=utf-8",
    b"csv" => "text/csv; charset=utf-8",
    b"md" => "text/markdown; charset=utf-8",

    b"png" => "image/png",
    b"jpg" => "image/jpeg",
    b"jpeg" => "image/jpeg",
    b"gif" => "image/gif",
    b"svg" => "image/svg+xml",
    b"ico" => "image/x-icon",
    b"webp" => "image/webp",
    b"bmp" => "image/bmp",

    b"woff" => "font/woff",
    b"woff2" => "font/woff2",
    b"ttf" => "font/ttf",
    b"otf" => "font/otf",

    b"mp3" => "audio/mpeg",
    b"wav" => "audio/wav",
    b"ogg" => "audio/ogg",
    b"mp4" => "video/mp4",
    b"webm" => "video/webm",

    b"pdf" => "application/pdf",
    b"wasm" => "application/wasm",
    b"zip" => "application/zip",
    b"gz" => "application/gzip",
    b"br" => "application/x-brotli",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(lookup("html"), "text/html; charset=utf-8");
        assert_eq!(lookup("HTML"), "text/html; charset=utf-8");
        assert_eq!(lookup("json"), "application/json");
    }

    #[test]
    fn unknown_extension_falls_back() {
        assert_eq!(lookup("xyz123"), "application/octet-stream");
        assert_eq!(lookup(""), "application/octet-stream");
    }
}
