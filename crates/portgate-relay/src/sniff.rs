//! Best-effort HTTP detection on relayed reads
//!
//! Only the current read is inspected; nothing is buffered across reads.

/// Three-byte prefixes of HTTP request lines and status lines
const HTTP_PREFIXES: [&[u8; 3]; 6] = [b"HTT", b"GET", b"POS", b"HEA", b"PUT", b"DEL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpSniff<'a> {
    /// A status line (`HTTP/1.1 200 OK`)
    Response,
    /// A request line, with the line itself when it is complete in this read
    Request(Option<&'a str>),
}

/// Classify the first bytes of a read
pub fn sniff_http(data: &[u8]) -> Option<HttpSniff<'_>> {
    if data.len() <= 3 {
        return None;
    }
    let prefix = &data[..3];
    if !HTTP_PREFIXES.iter().any(|p| p.as_slice() == prefix) {
        return None;
    }
    if prefix == b"HTT" {
        return Some(HttpSniff::Response);
    }
    let line = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .and_then(|end| std::str::from_utf8(&data[..end]).ok());
    Some(HttpSniff::Request(line))
}
