//! TLS ClientHello server name extraction
//!
//! The HTTPS side of the host server routes on SNI without terminating TLS,
//! so it only needs to peel the name out of the first record.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("not a TLS handshake record")]
    NotHandshake,

    #[error("ClientHello is truncated")]
    Truncated,

    #[error("ClientHello carries no server name")]
    NoServerName,

    #[error("invalid server name: {0}")]
    InvalidName(String),
}

const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16 * 1024 + 2048;

fn be16(data: &[u8], at: usize) -> Result<usize, SniError> {
    match data.get(at..at + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]]) as usize),
        None => Err(SniError::Truncated),
    }
}

fn byte(data: &[u8], at: usize) -> Result<usize, SniError> {
    data.get(at).map(|b| *b as usize).ok_or(SniError::Truncated)
}

/// Extract the server name from a ClientHello record
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    if client_hello.first() != Some(&0x16) {
        return Err(SniError::NotHandshake);
    }
    // Record header (5) + handshake header (4) + version (2) + random (32)
    let mut offset = 9 + 2 + 32;

    let session_id_len = byte(client_hello, offset)?;
    offset += 1 + session_id_len;

    let cipher_suites_len = be16(client_hello, offset)?;
    offset += 2 + cipher_suites_len;

    let compression_methods_len = byte(client_hello, offset)?;
    offset += 1 + compression_methods_len;

    let extensions_len = be16(client_hello, offset)?;
    offset += 2;
    let extensions_end = offset + extensions_len;
    if extensions_end > client_hello.len() {
        return Err(SniError::Truncated);
    }

    while offset + 4 <= extensions_end {
        let ext_type = be16(client_hello, offset)?;
        let ext_len = be16(client_hello, offset + 2)?;
        offset += 4;
        if offset + ext_len > extensions_end {
            return Err(SniError::Truncated);
        }
        if ext_type == 0x0000 {
            return parse_server_name(&client_hello[offset..offset + ext_len]);
        }
        offset += ext_len;
    }

    Err(SniError::NoServerName)
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    // server_name_list length (2), name_type (1), host_name length (2)
    if byte(data, 2)? != 0 {
        return Err(SniError::InvalidName("unsupported name type".to_string()));
    }
    let name_len = be16(data, 3)?;
    let name = data.get(5..5 + name_len).ok_or(SniError::Truncated)?;

    let hostname = String::from_utf8(name.to_vec())
        .map_err(|_| SniError::InvalidName("invalid UTF-8 in hostname".to_string()))?;
    if hostname.is_empty() {
        return Err(SniError::InvalidName("empty hostname".to_string()));
    }

    trace!("Extracted SNI hostname: {}", hostname);
    Ok(hostname)
}

/// Read one complete TLS record from `reader`
///
/// Returns the raw bytes so they can be replayed to the backend.
pub async fn read_client_hello<R>(reader: &mut R, timeout: Duration) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut record = vec![0u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut record).await?;
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        if record[0] != 0x16 || len > MAX_RECORD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a TLS handshake record",
            ));
        }
        record.resize(RECORD_HEADER_LEN + len, 0);
        reader.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
        Ok(record)
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ClientHello timeout"))?
}
