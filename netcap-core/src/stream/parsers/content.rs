//! Content type sniffing for extracted payloads.
//!
//! Signature-based detection over the first 512 bytes, in the spirit of the
//! WHATWG MIME sniffing algorithm. Always returns a type;
//! `application/octet-stream` when nothing matches.

const SNIFF_LEN: usize = 512;

/// (signature, content type), matched as a prefix.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"Rar!\x1a\x07", "application/x-rar-compressed"),
    (b"OggS\x00", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x00asm", "application/wasm"),
    (b"MZ", "application/x-msdownload"),
    (b"\x7fELF", "application/x-executable"),
];

/// HTML tags recognised after leading whitespace, case-insensitive.
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Detect the content type of `data`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    if data.is_empty() {
        return "text/plain; charset=utf-8";
    }

    let trimmed = trim_leading_ws(data);
    for tag in HTML_TAGS {
        if starts_with_tag(trimmed, tag) {
            return "text/html; charset=utf-8";
        }
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if data.len() >= 12 && &data[..4] == b"RIFF" {
        match &data[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            b"AVI " => return "video/avi",
            _ => {}
        }
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }

    for (signature, content_type) in SIGNATURES {
        if data.starts_with(signature) {
            return content_type;
        }
    }

    if data.starts_with(b"\xef\xbb\xbf") {
        return "text/plain; charset=utf-8";
    }
    if data.starts_with(b"\xfe\xff") {
        return "text/plain; charset=utf-16be";
    }
    if data.starts_with(b"\xff\xfe") {
        return "text/plain; charset=utf-16le";
    }

    if data.iter().any(|b| is_binary_byte(*b)) {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}

/// Drop parameters (`; charset=...`) from a content type.
pub fn trim_encoding(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

/// File extension (with dot) for a content type, empty when unknown.
pub fn extension_for(content_type: &str) -> &'static str {
    match trim_encoding(content_type) {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "text/xml" | "application/xml" => ".xml",
        "text/css" => ".css",
        "text/javascript" | "application/javascript" => ".js",
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        "application/postscript" => ".ps",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/webp" => ".webp",
        "image/x-icon" => ".ico",
        "application/zip" => ".zip",
        "application/x-gzip" => ".gz",
        "application/x-rar-compressed" => ".rar",
        "application/ogg" => ".ogg",
        "audio/mpeg" => ".mp3",
        "audio/wave" => ".wav",
        "video/avi" => ".avi",
        "video/mp4" => ".mp4",
        "font/woff" => ".woff",
        "font/woff2" => ".woff2",
        "application/wasm" => ".wasm",
        "application/x-msdownload" => ".exe",
        "application/x-executable" => ".elf",
        "application/octet-stream" => ".bin",
        _ => "",
    }
}

fn trim_leading_ws(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

/// Tag prefix followed by a space or `>`.
fn starts_with_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() <= tag.len() || !data[..tag.len()].eq_ignore_ascii_case(tag) {
        return false;
    }
    tag == b"<!--" || matches!(data[tag.len()], b' ' | b'>')
}

fn is_binary_byte(b: u8) -> bool {
    b <= 0x08 || b == 0x0b || (0x0e..=0x1a).contains(&b) || (0x1c..=0x1f).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Signature detection
    #[test]
    fn test_signatures() {
        assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\n\x00\x00"), "image/png");
        assert_eq!(detect_content_type(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(detect_content_type(b"\x1f\x8b\x08\x00\x00"), "application/x-gzip");
        assert_eq!(detect_content_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
    }

    // Test 2: Text and HTML
    #[test]
    fn test_text() {
        assert_eq!(detect_content_type(b"  <html><body>"), "text/html; charset=utf-8");
        assert_eq!(detect_content_type(b"hello world"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type(b"\x00\x01\x02"), "application/octet-stream");
    }

    // Test 3: Extensions and parameter trimming
    #[test]
    fn test_extensions() {
        assert_eq!(trim_encoding("text/html; charset=utf-8"), "text/html");
        assert_eq!(extension_for("text/html; charset=utf-8"), ".html");
        assert_eq!(extension_for("image/jpeg"), ".jpg");
        assert_eq!(extension_for("application/x-unknown"), "");
    }
}
