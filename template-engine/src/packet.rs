//! Raw HTTP/1.x packet handling
//!
//! Requests and responses travel through the engine as raw bytes. This
//! module splits them into start line, headers and body and reassembles
//! them. Header text is carried through [`codec::from_bytes`] so non UTF-8
//! bytes survive a round trip.

use crate::codec;
use indexmap::IndexMap;

/// A parsed HTTP/1.x request or response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPacket {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Byte offsets of the header block end and the body start
fn head_bounds(packet: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(packet, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(packet, b"\n\n").map(|i| (i, i + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split into header section (without the blank line) and body
pub fn split_packet(packet: &[u8]) -> (&[u8], &[u8]) {
    match head_bounds(packet) {
        Some((end, body)) => (&packet[..end], &packet[body..]),
        None => (packet, &[]),
    }
}

impl RawPacket {
    pub fn parse(packet: &[u8]) -> Self {
        let (head, body) = split_packet(packet);
        let head = codec::from_bytes(head.to_vec());
        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));
        let start_line = lines.next().unwrap_or_default().to_string();
        let headers = lines
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(':') {
                Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
                None => (line.trim().to_string(), String::new()),
            })
            .collect();
        Self {
            start_line,
            headers,
            body: body.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = self.start_line.clone();
        head.push_str("\r\n");
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        let mut out = codec::to_bytes(&head);
        out.extend_from_slice(&self.body);
        out
    }

    /// Status code of a response; 0 when the start line is not a status line
    pub fn status_code(&self) -> u16 {
        let mut parts = self.start_line.split_whitespace();
        match parts.next() {
            Some(proto) if proto.to_ascii_uppercase().starts_with("HTTP/") => {
                parts.next().and_then(|code| code.parse().ok()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn method(&self) -> &str {
        self.start_line.split_whitespace().next().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.start_line.split_whitespace().nth(1).unwrap_or("/")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace the first header with this name, or append one
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Header block as a string: start line plus header lines, CRLF terminated
    pub fn header_block(&self) -> String {
        let mut block = self.start_line.clone();
        block.push_str("\r\n");
        for (name, value) in &self.headers {
            block.push_str(&format!("{}: {}\r\n", name, value));
        }
        block
    }

    /// Make Content-Length agree with the body; chunked bodies are left alone
    pub fn fix_content_length(&mut self) {
        let chunked = self
            .header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            return;
        }
        if !self.body.is_empty() || self.header("Content-Length").is_some() {
            let len = self.body.len().to_string();
            self.set_header("Content-Length", &len);
        }
    }

    /// Absolute URL of a request packet
    pub fn request_url(&self, is_https: bool) -> Option<String> {
        let path = self.path();
        if path.starts_with("http://") || path.starts_with("https://") {
            return Some(path.to_string());
        }
        let host = self.header("Host")?;
        let scheme = if is_https { "https" } else { "http" };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Some(format!("{}://{}{}", scheme, host, path))
    }

    /// `name=value` pairs of every Set-Cookie header
    pub fn set_cookies(&self) -> Vec<(String, String)> {
        self.header_values("Set-Cookie")
            .filter_map(|value| {
                let pair = value.split(';').next()?.trim();
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Merge a cookie jar into the Cookie header; cookies already in the
    /// packet win over jar entries with the same name
    pub fn merge_cookies(&mut self, jar: &IndexMap<String, String>) {
        if jar.is_empty() {
            return;
        }
        let mut merged = jar.clone();
        if let Some(existing) = self.header("Cookie") {
            for pair in existing.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    merged.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
        let header = merged
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        self.set_header("Cookie", &header);
    }
}

/// Normalize bare LF to CRLF in the header section; the body is kept as is
pub fn normalize_crlf(packet: &str) -> String {
    let packet = packet.trim_start_matches(['\r', '\n']);
    let (head, body) = match head_bounds(packet.as_bytes()) {
        Some((end, body)) => (&packet[..end], Some(&packet[body..])),
        None => (packet.trim_end_matches(['\r', '\n']), None),
    };
    let mut out = head
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\r\n");
    out.push_str("\r\n\r\n");
    if let Some(body) = body {
        out.push_str(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &[u8] =
        b"HTTP/1.1 302 Found\r\nLocation: /login\r\nSet-Cookie: sid=abc; Path=/\r\nSet-Cookie: lang=en\r\n\r\nbody";

    #[test]
    fn test_parse_response() {
        let packet = RawPacket::parse(RESPONSE);
        assert_eq!(packet.status_code(), 302);
        assert_eq!(packet.header("location"), Some("/login"));
        assert_eq!(packet.body, b"body");
        assert_eq!(
            packet.set_cookies(),
            vec![
                ("sid".to_string(), "abc".to_string()),
                ("lang".to_string(), "en".to_string())
            ]
        );
        assert!(packet.header_block().starts_with("HTTP/1.1 302 Found\r\n"));
    }

    #[test]
    fn test_request_url_and_headers() {
        let mut packet = RawPacket::parse(b"POST /api?a=1 HTTP/1.1\nHost: example.com\n\nx=1");
        assert_eq!(packet.method(), "POST");
        assert_eq!(
            packet.request_url(true).as_deref(),
            Some("https://example.com/api?a=1")
        );
        packet.fix_content_length();
        assert_eq!(packet.header("Content-Length"), Some("3"));
        let bytes = packet.to_bytes();
        assert!(bytes.ends_with(b"\r\n\r\nx=1"));
    }

    #[test]
    fn test_merge_cookies_keeps_explicit() {
        let mut packet = RawPacket::parse(b"GET / HTTP/1.1\r\nCookie: sid=mine\r\n\r\n");
        let mut jar = IndexMap::new();
        jar.insert("sid".to_string(), "jar".to_string());
        jar.insert("lang".to_string(), "en".to_string());
        packet.merge_cookies(&jar);
        assert_eq!(packet.header("Cookie"), Some("sid=mine; lang=en"));
    }

    #[test]
    fn test_normalize_crlf() {
        assert_eq!(
            normalize_crlf("GET / HTTP/1.1\nHost: a\n\nline1\nline2"),
            "GET / HTTP/1.1\r\nHost: a\r\n\r\nline1\nline2"
        );
        assert_eq!(normalize_crlf("\nGET / HTTP/1.1\nHost: a\n"), "GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[test]
    fn test_binary_body_survives() {
        let raw = b"HTTP/1.1 200 OK\r\nX: \xff\r\n\r\n\x00\xff".to_vec();
        let packet = RawPacket::parse(&raw);
        assert_eq!(packet.to_bytes(), raw);
    }
}
