//! Traffic relay engine
//!
//! Bounded pools of relay pairs and copy jobs, pooled buffers, HTTP sniffing,
//! per-client admission (black IP list, connection ceiling, rate limit) and the
//! batched traffic accountant that enforces account quotas.

pub mod accountant;
pub mod admission;
pub mod buffer;
pub mod engine;
pub mod limiter;
pub mod pool;
pub mod sniff;

pub use accountant::{AccountantConfig, TrafficAccountant};
pub use admission::{Admission, ClientRuntimes, ConnGuard};
pub use buffer::{BufferPool, PooledBuffer};
pub use engine::{RelayConfig, RelayContext, RelayEngine, RelayOutcome, RelayReport};
pub use limiter::RateLimiter;
pub use pool::{PoolSlot, WorkerPool};

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("worker pool {0} is closed")]
    PoolClosed(&'static str),

    #[error("connection from black-listed address {0}")]
    Blocked(IpAddr),

    #[error("client {client_id} reached its connection limit of {max}")]
    ConnectionLimit { client_id: i64, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
