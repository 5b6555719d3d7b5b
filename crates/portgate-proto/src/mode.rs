//! Tunnel modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Network mode of a tunnel
///
/// The set is closed: records carrying an unknown mode string are rejected when
/// they are loaded, not when the task is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "socks5")]
    Socks5,
    #[serde(rename = "httpProxy")]
    HttpProxy,
    #[serde(rename = "tcpTrans")]
    TcpTrans,
    #[serde(rename = "secret")]
    Secret,
    #[serde(rename = "p2p")]
    P2p,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "webServer")]
    WebServer,
    #[serde(rename = "httpHostServer")]
    HttpHostServer,
    #[serde(rename = "https")]
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tunnel mode: {0}")]
pub struct ParseModeError(pub String);

impl Mode {
    pub const ALL: [Mode; 11] = [
        Mode::Tcp,
        Mode::Udp,
        Mode::Socks5,
        Mode::HttpProxy,
        Mode::TcpTrans,
        Mode::Secret,
        Mode::P2p,
        Mode::File,
        Mode::WebServer,
        Mode::HttpHostServer,
        Mode::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Udp => "udp",
            Mode::Socks5 => "socks5",
            Mode::HttpProxy => "httpProxy",
            Mode::TcpTrans => "tcpTrans",
            Mode::Secret => "secret",
            Mode::P2p => "p2p",
            Mode::File => "file",
            Mode::WebServer => "webServer",
            Mode::HttpHostServer => "httpHostServer",
            Mode::Https => "https",
        }
    }

    /// Secret and p2p tasks are matched over the bridge and never listen
    pub fn is_portless(&self) -> bool {
        matches!(self, Mode::Secret | Mode::P2p)
    }

    /// Modes whose port is not probed before start
    ///
    /// `httpHostServer` shares the configured HTTP/HTTPS listener ports and
    /// `https` is served through host routing.
    pub fn skips_port_probe(&self) -> bool {
        matches!(self, Mode::HttpHostServer | Mode::Https) || self.is_portless()
    }

    /// Whether the public side of this mode is a UDP socket
    pub fn is_udp(&self) -> bool {
        matches!(self, Mode::Udp)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ParseModeError(s.to_string()))
    }
}
