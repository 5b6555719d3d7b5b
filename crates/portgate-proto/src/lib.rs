//! Portgate data model
//!
//! Records shared by every portgate crate: tunnels (tasks), clients, host routes,
//! flow counters, backend targets and the per-task health settings. Fields that are
//! derived at runtime (`run_status`, `is_connect`, `now_conn`, `is_http`) are never
//! persisted; they are skipped by serde and recomputed by the control plane.

pub mod client;
pub mod ip_list;
pub mod mode;
pub mod target;
pub mod tunnel;

pub use client::Client;
pub use ip_list::{IpList, IpListError};
pub use mode::{Mode, ParseModeError};
pub use target::{Target, TargetError};
pub use tunnel::{password_digest, Flow, Health, HealthCheckType, Host, MultiAccount, Tunnel};

/// Account id used for tasks that are not billed against any quota
pub const UNBILLED_ACCOUNT: i64 = 0;
