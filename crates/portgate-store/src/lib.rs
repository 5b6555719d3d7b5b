//! Persistence interface of the broker
//!
//! The control plane, the relay and the traffic accountant only talk to storage
//! through [`Store`]. Implementations must not cache: callers re-fetch records
//! whenever they need a fresh view. [`MemoryStore`] is the bundled
//! implementation, optionally seeded from a JSON document.

pub mod memory;
pub mod seed;

pub use memory::MemoryStore;
pub use seed::{Account, Seed};

use portgate_proto::{Client, Host, Tunnel};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("client {0} not found")]
    ClientNotFound(i64),

    #[error("host {0} not found")]
    HostNotFound(i64),

    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("secret mode password must be unique")]
    DuplicatePassword,

    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid seed document: {0}")]
    Seed(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Injected persistence operations
///
/// Every call is a full round trip to the backend. Returned records are
/// detached copies; mutating them has no effect until written back.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_task(&self, id: i64) -> Result<Tunnel, StoreError>;

    async fn all_tasks(&self) -> Result<Vec<Tunnel>, StoreError>;

    async fn tasks_by_client(&self, client_id: i64) -> Result<Vec<Tunnel>, StoreError>;

    /// Tasks billed to `account_id`, optionally narrowed to one client
    async fn user_tasks(
        &self,
        account_id: i64,
        client_id: Option<i64>,
    ) -> Result<Vec<Tunnel>, StoreError>;

    /// Persist a new task, assigning an id when `task.id` is zero
    async fn new_task(&self, task: Tunnel) -> Result<i64, StoreError>;

    async fn update_task(&self, task: &Tunnel) -> Result<(), StoreError>;

    async fn del_task(&self, id: i64) -> Result<(), StoreError>;

    /// Secret / p2p task whose password hashes to `digest`
    async fn task_by_password_md5(&self, digest: &str) -> Result<Option<Tunnel>, StoreError>;

    async fn get_client(&self, id: i64) -> Result<Client, StoreError>;

    async fn all_clients(&self) -> Result<Vec<Client>, StoreError>;

    async fn new_client(&self, client: Client) -> Result<i64, StoreError>;

    async fn update_client(&self, client: &Client) -> Result<(), StoreError>;

    async fn del_client(&self, id: i64) -> Result<(), StoreError>;

    async fn all_hosts(&self) -> Result<Vec<Host>, StoreError>;

    async fn hosts_by_client(&self, client_id: i64) -> Result<Vec<Host>, StoreError>;

    async fn new_host(&self, host: Host) -> Result<i64, StoreError>;

    async fn del_host(&self, id: i64) -> Result<(), StoreError>;

    /// Remaining quota of an account, in bytes
    async fn account_flow_limit(&self, account_id: i64) -> Result<i64, StoreError>;

    /// Adjust remaining quota by `delta_kb` kilobytes; negative consumes
    async fn add_traffic(&self, account_id: i64, delta_kb: f64) -> Result<(), StoreError>;
}
