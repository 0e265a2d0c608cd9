//! Multipart/mixed framing for GetObject responses.
//!
//! The server's framing is a strict subset of MIME: parts are bounded by
//! `\r\n--<boundary>`, headers end at the first `\r\n\r\n`, and the final
//! boundary carries a `--` suffix. A zero-copy scan over the response buffer
//! is both sufficient and considerably more predictable than a general MIME
//! library against this server.

use std::collections::BTreeMap;

use bytes::Bytes;

/// One part of a multipart body: parsed headers plus the untouched payload.
#[derive(Debug, Clone)]
pub struct RawPart {
    /// Header name → value, names lower-cased.
    pub headers: BTreeMap<String, String>,
    /// Payload bytes exactly as bounded by the framing.
    pub body: Bytes,
}

impl RawPart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }
}

/// Extract `boundary=...` from a Content-Type header value. Quotes around
/// the boundary token are stripped.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let param = param.trim();
        param
            .strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

/// Split `body` into parts bounded by `--<boundary>`. The payload of each
/// part is a cheap slice of the source buffer.
pub fn split_parts(body: &Bytes, boundary: &str) -> Vec<RawPart> {
    let delim = format!("--{}", boundary);
    let delim = delim.as_bytes();
    let mut parts = Vec::new();

    let mut cursor = 0;
    let mut starts = Vec::new();
    while let Some(pos) = find(&body[cursor..], delim) {
        starts.push(cursor + pos);
        cursor += pos + delim.len();
    }

    for window in starts.windows(2) {
        if let Some(part) = cut_part(body, window[0] + delim.len(), window[1]) {
            parts.push(part);
        }
    }
    // Tail after the last boundary only matters when the final `--` marker
    // is missing; cut_part rejects the empty remainder either way.
    if let Some(&last) = starts.last() {
        let tail_start = last + delim.len();
        if body.len() > tail_start && !body[tail_start..].starts_with(b"--") {
            if let Some(part) = cut_part(body, tail_start, body.len()) {
                parts.push(part);
            }
        }
    }

    parts
}

/// Locate the JPEG start-of-image marker (`FF D8`) inside a part body.
/// Agent/Office photo parts prepend extra framing before the image proper.
pub fn find_jpeg_start(body: &[u8]) -> Option<usize> {
    body.windows(2).position(|w| w == [0xFF, 0xD8])
}

fn cut_part(body: &Bytes, start: usize, end: usize) -> Option<RawPart> {
    let region = &body[start..end];
    // Skip the CRLF that terminates the boundary line. A `--` here is the
    // closing marker, not a part.
    let region_start = if region.starts_with(b"\r\n") {
        start + 2
    } else if region.starts_with(b"--") {
        return None;
    } else {
        start
    };

    let region = &body[region_start..end];
    let header_end = find(region, b"\r\n\r\n")?;
    let headers = parse_headers(&region[..header_end]);

    let mut body_start = region_start + header_end + 4;
    let mut body_end = end;
    // The trailing CRLF belongs to the next boundary line, not the payload.
    if body_end >= 2 + body_start && body[body_end - 2..body_end] == *b"\r\n" {
        body_end -= 2;
    }
    if body_start > body_end {
        body_start = body_end;
    }

    Some(RawPart {
        headers,
        body: body.slice(body_start..body_end),
    })
}

fn parse_headers(raw: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in String::from_utf8_lossy(raw).split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
