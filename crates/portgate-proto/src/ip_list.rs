//! Black IP list matching
//!
//! Entries are single addresses (`203.0.113.7`, `::1`) or CIDR blocks
//! (`10.0.0.0/8`). The list is parsed once when the owning client record is
//! loaded, so a malformed entry is rejected at load time.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpListError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    base: IpAddr,
    prefix: u8,
}

impl Block {
    fn full_prefix(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() {
            32
        } else {
            128
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        match (self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let shift = 32 - u32::from(self.prefix);
                let mask = u32::MAX.checked_shl(shift).unwrap_or(0);
                u32::from(base) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let shift = 128 - u32::from(self.prefix);
                let mask = u128::MAX.checked_shl(shift).unwrap_or(0);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Block {
    type Err = IpListError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (entry, None),
        };
        let base = IpAddr::from_str(addr)
            .map(canonical)
            .map_err(|_| IpListError::InvalidAddress(entry.to_string()))?;
        let max = Block::full_prefix(&base);
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| IpListError::InvalidCidr(entry.to_string()))?,
            None => max,
        };
        Ok(Block { base, prefix })
    }
}

/// IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) are compared as IPv4
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Addresses a client refuses public connections from
///
/// Serialized as the plain list of entries. An empty list blocks nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct IpList {
    entries: Vec<String>,
    blocks: Vec<Block>,
}

impl IpList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank lines and surrounding whitespace are ignored
    pub fn parse<I, S>(entries: I) -> Result<Self, IpListError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = IpList::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let block = entry.parse::<Block>()?;
            if !list.blocks.contains(&block) {
                list.blocks.push(block);
                list.entries.push(entry.to_string());
            }
        }
        Ok(list)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.blocks.iter().any(|block| block.matches(ip))
    }

    pub fn contains_peer(&self, peer: &SocketAddr) -> bool {
        self.contains(peer.ip())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl TryFrom<Vec<String>> for IpList {
    type Error = IpListError;

    fn try_from(entries: Vec<String>) -> Result<Self, Self::Error> {
        IpList::parse(entries)
    }
}

impl From<IpList> for Vec<String> {
    fn from(list: IpList) -> Self {
        list.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_empty_list_blocks_nothing() {
        let list = IpList::new();
        assert!(list.is_empty());
        assert!(!list.contains(v4(1, 2, 3, 4)));
    }

    #[test]
    fn test_single_address() {
        let list = IpList::parse(["203.0.113.7"]).unwrap();
        assert!(list.contains(v4(203, 0, 113, 7)));
        assert!(!list.contains(v4(203, 0, 113, 8)));
    }

    #[test]
    fn test_cidr_blocks() {
        let list = IpList::parse(["10.0.0.0/8", "192.168.1.0/24"]).unwrap();
        assert!(list.contains(v4(10, 200, 3, 4)));
        assert!(list.contains(v4(192, 168, 1, 250)));
        assert!(!list.contains(v4(192, 168, 2, 1)));
        assert!(!list.contains(v4(11, 0, 0, 1)));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let list = IpList::parse(["0.0.0.0/0"]).unwrap();
        assert!(list.contains(v4(8, 8, 8, 8)));
        assert!(!list.contains(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))));
    }

    #[test]
    fn test_ipv6_and_mapped_peers() {
        let list = IpList::parse(["2001:db8::/32", "198.51.100.1"]).unwrap();
        assert!(list.contains(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 7, 0, 0, 0, 0, 1))));

        let mapped = IpAddr::V6(Ipv4Addr::new(198, 51, 100, 1).to_ipv6_mapped());
        assert!(list.contains(mapped));

        let peer: SocketAddr = "198.51.100.1:4040".parse().unwrap();
        assert!(list.contains_peer(&peer));
    }

    #[test]
    fn test_blank_and_duplicate_entries() {
        let list = IpList::parse(["", "  1.1.1.1 ", "1.1.1.1", "\r"]).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries(), &["1.1.1.1".to_string()]);
    }

    #[test]
    fn test_invalid_entries() {
        assert_eq!(
            IpList::parse(["not-an-ip"]).unwrap_err(),
            IpListError::InvalidAddress("not-an-ip".to_string())
        );
        assert_eq!(
            IpList::parse(["10.0.0.0/33"]).unwrap_err(),
            IpListError::InvalidCidr("10.0.0.0/33".to_string())
        );
    }

    #[test]
    fn test_serde_as_plain_list() {
        let list: IpList = serde_json::from_str(r#"["10.0.0.0/8","1.2.3.4"]"#).unwrap();
        assert!(list.contains(v4(10, 1, 1, 1)));
        assert_eq!(
            serde_json::to_string(&list).unwrap(),
            r#"["10.0.0.0/8","1.2.3.4"]"#
        );
        assert!(serde_json::from_str::<IpList>(r#"["bogus"]"#).is_err());
    }
}
