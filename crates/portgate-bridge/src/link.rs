//! Data links opened through a client

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream the relay can drive
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Tcp,
    Udp,
    /// Served from the client's local file system
    File,
}

/// Request for a data stream from a client to one of its backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub kind: LinkKind,
    /// Backend address on the client side, or the served path for `File`
    pub target: String,
    /// Public peer the stream serves, for the client's logs
    pub remote_addr: Option<SocketAddr>,
    pub crypt: bool,
    pub compress: bool,
}

impl Link {
    pub fn new(kind: LinkKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            remote_addr: None,
            crypt: false,
            compress: false,
        }
    }

    pub fn tcp(target: impl Into<String>) -> Self {
        Self::new(LinkKind::Tcp, target)
    }

    pub fn with_remote(mut self, remote: Option<SocketAddr>) -> Self {
        self.remote_addr = remote;
        self
    }
}
