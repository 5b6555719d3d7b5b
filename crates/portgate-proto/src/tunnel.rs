//! Tunnel (task) and host route records

use crate::client::Client;
use crate::mode::Mode;
use crate::target::Target;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Lowercase hex MD5 of a secret-mode password, as presented over the bridge
pub fn password_digest(password: &str) -> String {
    format!("{:x}", Md5::digest(password.as_bytes()))
}

/// Byte counters of a task, host or client
///
/// Counters only ever grow. Increments are lock-free so the relay can update
/// them from every copy job.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub export_flow: AtomicI64,
    #[serde(default)]
    pub inlet_flow: AtomicI64,
    #[serde(default)]
    pub flow_limit: i64,
}

impl Flow {
    pub fn add(&self, inlet: i64, export: i64) {
        if inlet > 0 {
            self.inlet_flow.fetch_add(inlet, Ordering::Relaxed);
        }
        if export > 0 {
            self.export_flow.fetch_add(export, Ordering::Relaxed);
        }
    }

    pub fn inlet(&self) -> i64 {
        self.inlet_flow.load(Ordering::Relaxed)
    }

    pub fn export(&self) -> i64 {
        self.export_flow.load(Ordering::Relaxed)
    }
}

impl Clone for Flow {
    fn clone(&self) -> Self {
        Self {
            export_flow: AtomicI64::new(self.export()),
            inlet_flow: AtomicI64::new(self.inlet()),
            flow_limit: self.flow_limit,
        }
    }
}

/// Whether the task's last relayed read started with an HTTP request or status line
#[derive(Debug, Default)]
pub struct HttpMark(AtomicBool);

impl HttpMark {
    pub fn set(&self, http: bool) {
        self.0.store(http, Ordering::Relaxed);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Clone for HttpMark {
    fn clone(&self) -> Self {
        Self(AtomicBool::new(self.get()))
    }
}

impl Serialize for HttpMark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(self.get())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Tcp,
    Http,
}

/// Health probe settings of a task
///
/// Probing is disabled unless both `check_interval` and `max_fail` are set.
/// Failure counters and the next-check time live in the health checker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Health {
    /// Seconds allowed for a single probe
    pub check_timeout: u64,
    /// Consecutive failures before a target leaves rotation
    pub max_fail: u32,
    /// Seconds between probe rounds
    pub check_interval: u64,
    pub check_type: HealthCheckType,
    /// Path probed by HTTP checks, e.g. `/healthz`
    pub http_url: String,
    /// Comma separated addresses to probe; empty probes the task targets
    pub check_target: String,
}

impl Health {
    pub fn is_enabled(&self) -> bool {
        self.check_interval > 0 && self.max_fail > 0
    }

    pub fn probe_targets(&self, target: &Target) -> Vec<String> {
        let explicit: Vec<String> = self
            .check_target
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if explicit.is_empty() {
            target.addresses().to_vec()
        } else {
            explicit
        }
    }
}

/// Username to password map for SOCKS5 authentication
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiAccount {
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}

impl MultiAccount {
    pub fn verify(&self, user: &str, password: &str) -> bool {
        self.accounts.get(user).is_some_and(|p| p == password)
    }
}

/// A configured relay rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: i64,
    /// Billing account; zero or negative means unbilled
    #[serde(default)]
    pub account_id: i64,
    pub client_id: i64,
    #[serde(default)]
    pub port: u16,
    /// Address the public listener binds; empty binds all interfaces
    #[serde(default)]
    pub server_ip: String,
    pub mode: Mode,
    /// Administrator intent: the task should be served
    #[serde(default)]
    pub status: bool,
    /// Live registry membership, filled in by projections
    #[serde(default, skip_deserializing)]
    pub run_status: bool,
    #[serde(default)]
    pub flow: Flow,
    /// Secret / p2p password
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub target: Target,
    /// Ephemeral tunnel registered by a client at runtime
    #[serde(default)]
    pub no_store: bool,
    #[serde(default, skip_deserializing)]
    pub is_http: HttpMark,
    /// Directory served by `file` mode
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub strip_pre: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub header_change: String,
    #[serde(default)]
    pub host_change: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub multi_account: Option<MultiAccount>,
    #[serde(default)]
    pub health: Health,
    /// Owning client, attached by projections
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub client: Option<Client>,
}

impl Tunnel {
    pub fn new(id: i64, client_id: i64, mode: Mode) -> Self {
        Self {
            id,
            client_id,
            mode,
            status: true,
            ..Default::default()
        }
    }

    pub fn is_billable(&self) -> bool {
        self.account_id > 0
    }

    /// Listener address `server_ip:port`
    pub fn bind_addr(&self) -> String {
        let ip = if self.server_ip.is_empty() {
            "0.0.0.0"
        } else {
            self.server_ip.as_str()
        };
        format!("{}:{}", ip, self.port)
    }

    pub fn password_matches(&self, digest: &str) -> bool {
        !self.password.is_empty() && password_digest(&self.password) == digest
    }
}

/// Virtual host route served by the shared HTTP listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub id: i64,
    pub client_id: i64,
    pub host: String,
    pub header_change: String,
    pub host_change: String,
    /// URL path prefix; empty or `/` matches every path
    pub location: String,
    pub remark: String,
    /// `http`, `https` or `all`
    pub scheme: String,
    pub no_store: bool,
    pub is_close: bool,
    pub target: Target,
    pub flow: Flow,
}

impl Host {
    pub fn serves_scheme(&self, scheme: &str) -> bool {
        self.scheme.is_empty() || self.scheme == "all" || self.scheme == scheme
    }

    pub fn location_matches(&self, path: &str) -> bool {
        let location = self.location.trim_end_matches('/');
        location.is_empty() || path.starts_with(location)
    }
}
