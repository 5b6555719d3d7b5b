//! Minimal HTTP/1.x request head reader
//!
//! Only what proxying needs: request line, headers in order, and whatever
//! body bytes arrived with the head.

use crate::ServerError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a header's value, appending it when missing
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Path part of the request target, for location matching
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        let path = match target.find("://") {
            Some(i) => target[i + 3..].find('/').map_or("/", |p| &target[i + 3 + p..]),
            None => target,
        };
        path.split('?').next().unwrap_or(path)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read until the end of the request head
///
/// Returns the parsed head and any bytes read past it.
pub async fn read_request_head<R>(reader: &mut R) -> Result<(RequestHead, Vec<u8>), ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Protocol("connection closed before request head".into()));
        }
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf[scan_from..]).map(|e| e + scan_from) {
            let head = parse_request_head(&buf[..end])?;
            return Ok((head, buf[end..].to_vec()));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ServerError::Protocol("request head too large".into()));
        }
    }
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, ServerError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ServerError::Protocol("request head is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m, t, v),
        _ => {
            return Err(ServerError::Protocol(format!(
                "malformed request line: {:?}",
                request_line
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ServerError::Protocol(format!("malformed header: {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Write a short plain-text error response
pub fn error_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        reason.len(),
        reason
    )
    .into_bytes()
}
