//! Client records

use crate::ip_list::IpList;
use crate::tunnel::Flow;
use serde::{Deserialize, Serialize};

/// A remote agent that registers over the bridge
///
/// `is_connect`, `now_conn` and `version` are live values attached by the
/// control plane; they are never read back from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    #[serde(default)]
    pub account_id: i64,
    /// Shared secret the client authenticates the bridge connection with
    pub verify_key: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub status: bool,
    #[serde(default, skip_deserializing)]
    pub is_connect: bool,
    /// KB/s shared by every relay of the client; 0 is unlimited
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub flow: Flow,
    /// Registered at runtime and dropped when the client disconnects
    #[serde(default)]
    pub no_store: bool,
    #[serde(default)]
    pub no_display: bool,
    /// Concurrent public connections allowed; 0 is unlimited
    #[serde(default)]
    pub max_conn: u32,
    #[serde(default, skip_deserializing)]
    pub now_conn: u32,
    /// Tasks plus hosts the client may own; 0 is unlimited
    #[serde(default)]
    pub max_tunnel_num: u32,
    #[serde(default, skip_deserializing)]
    pub version: String,
    #[serde(default)]
    pub black_ip_list: IpList,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub last_online_time: String,
}

impl Client {
    pub fn new(id: i64, verify_key: impl Into<String>) -> Self {
        Self {
            id,
            verify_key: verify_key.into(),
            status: true,
            create_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ..Default::default()
        }
    }

    /// Whether a client owning `owned` tasks and hosts may add one more
    pub fn has_tunnel_capacity(&self, owned: usize) -> bool {
        self.max_tunnel_num == 0 || owned < self.max_tunnel_num as usize
    }
}
