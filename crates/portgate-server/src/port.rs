//! Which ports a task may bind, and whether they are free

use crate::ServerError;
use portgate_proto::Mode;
use std::net::{TcpListener, UdpSocket};
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortPolicyError {
    #[error("invalid port entry: {0}")]
    InvalidEntry(String),
}

/// Allow-list of ports, `8000-9000,10022` style; empty allows every port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPolicy {
    allowed: Vec<RangeInclusive<u16>>,
}

impl PortPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|r| r.contains(&port))
    }

    /// Check that `port` is allowed and can be bound for `mode`
    ///
    /// Binding is probed with a throwaway socket on all interfaces; UDP tasks
    /// probe a UDP socket. Port 0 asks the OS for an ephemeral port and always
    /// passes the probe.
    pub fn check(&self, mode: Mode, port: u16) -> Result<(), ServerError> {
        if !self.is_allowed(port) {
            return Err(ServerError::PortUnavailable {
                port,
                reason: "not in the allowed range".to_string(),
            });
        }
        if port == 0 {
            return Ok(());
        }
        let addr = ("0.0.0.0", port);
        let probe = if mode.is_udp() {
            UdpSocket::bind(addr).map(drop)
        } else {
            TcpListener::bind(addr).map(drop)
        };
        probe.map_err(|e| ServerError::PortUnavailable {
            port,
            reason: e.to_string(),
        })
    }
}

impl FromStr for PortPolicy {
    type Err = PortPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut allowed = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || PortPolicyError::InvalidEntry(entry.to_string());
            let range = match entry.split_once('-') {
                Some((start, end)) => {
                    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
                    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
                    if start > end {
                        return Err(invalid());
                    }
                    start..=end
                }
                None => {
                    let port: u16 = entry.parse().map_err(|_| invalid())?;
                    port..=port
                }
            };
            allowed.push(range);
        }
        Ok(Self { allowed })
    }
}
