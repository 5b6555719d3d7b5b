//! Bridge between the broker core and connected clients
//!
//! The control-channel transport itself (framing, multiplexing, encryption,
//! heartbeats) lives outside this crate. What the core needs from it is
//! captured by two seams:
//!
//! - [`Bridge`]: open a data link to a connected client and query the live
//!   connection table.
//! - [`BridgeEvent`]: control events (open/close task, client gone, secret
//!   handshake) delivered over an mpsc channel to the dispatcher.
//!
//! [`SessionBridge`] implements both on top of per-client [`LinkOpener`]s that a
//! transport registers when a client authenticates.

pub mod events;
pub mod link;
pub mod session;

pub use events::{BridgeEvent, SecretSession};
pub use link::{BoxedStream, DuplexStream, Link, LinkKind};
pub use session::{ClientSession, LinkOpener, SessionBridge};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client {0} is not connected")]
    ClientNotConnected(i64),

    #[error("client {client_id} refused link to {target}: {reason}")]
    LinkRefused {
        client_id: i64,
        target: String,
        reason: String,
    },

    #[error("bridge event channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the core asks of the control channel
#[async_trait::async_trait]
pub trait Bridge: Send + Sync {
    /// Open a data stream through client `client_id` to `link.target`
    async fn open_link(&self, client_id: i64, link: Link) -> Result<BoxedStream, BridgeError>;

    /// Live connection table membership
    fn is_connected(&self, client_id: i64) -> bool;

    /// Version string the client reported when it connected
    fn client_version(&self, client_id: i64) -> Option<String>;

    fn connected_clients(&self) -> Vec<i64>;

    /// Drop the client's control connection and its table entry
    async fn disconnect_client(&self, client_id: i64);
}
