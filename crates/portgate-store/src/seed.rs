//! JSON seed document for [`MemoryStore`](crate::MemoryStore)

use crate::StoreError;
use portgate_proto::{Client, Host, Tunnel};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Billing account with its remaining quota
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    /// Remaining quota in KB
    #[serde(default)]
    pub flow_kb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub clients: Vec<Client>,
    pub tasks: Vec<Tunnel>,
    pub hosts: Vec<Host>,
    pub accounts: Vec<Account>,
}

impl Seed {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&raw)
    }
}
