//! Task orchestration for the broker
//!
//! - [`Orchestrator`]: the registry of running tasks and their lifecycle
//!   (add, start, stop, delete, create, reload), plus the read projections the
//!   admin surface consumes.
//! - [`ModeDispatcher`]: maps each [`Mode`] to the service that serves it.
//! - [`BridgeDispatcher`]: the single loop turning bridge events into registry
//!   operations.
//! - [`HealthChecker`]: periodic backend probing that marks targets down/up.

pub mod dispatch;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod projection;

pub use dispatch::{ModeDispatcher, WebServerFactory};
pub use events::BridgeDispatcher;
pub use health::HealthChecker;
pub use orchestrator::{Orchestrator, RunningTask};
pub use projection::{
    ClientPage, ClientQuery, Dashboard, SortField, SortOrder, TunnelPage, TunnelQuery,
};

use portgate_proto::Mode;
use portgate_server::ServerError;
use portgate_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    #[error("task {0} is not running")]
    NotRunning(i64),

    #[error("task {0} is already running")]
    AlreadyRunning(i64),

    #[error("no task matches the presented password")]
    PasswordNotFound,

    #[error("task {0} is disabled")]
    TaskDisabled(i64),

    #[error("mode {0} has no service")]
    ModeNotSupported(Mode),

    #[error("client {client_id} reached its limit of {max} tunnels")]
    TunnelLimitExceeded { client_id: i64, max: u32 },

    #[error("client {0} not found")]
    ClientNotFound(i64),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("service error: {0}")]
    Server(ServerError),
}

impl From<ServerError> for ControlError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::PortUnavailable { port, reason } => {
                ControlError::PortUnavailable { port, reason }
            }
            other => ControlError::Server(other),
        }
    }
}
