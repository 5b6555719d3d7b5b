//! Mode services of the broker
//!
//! Each running task is backed by one [`Service`]. Listening services accept
//! public connections, admit them against the owning client, pick a backend
//! target, open a link (through the bridge, or directly for local-proxy
//! targets) and hand both ends to the relay engine.

pub mod context;
pub mod host;
pub mod host_server;
pub mod http_head;
pub mod http_proxy;
pub mod https;
pub mod listener;
pub mod port;
pub mod secret;
pub mod sni;
pub mod socks5;
pub mod tunnel;
pub mod udp;

pub use context::{ServerContext, ServerSettings};
pub use host::{HostRoutes, RouteMatch};
pub use host_server::HttpHostServer;
pub use http_proxy::HttpProxyServer;
pub use https::HttpsRouteService;
pub use listener::BoundAddr;
pub use port::{PortPolicy, PortPolicyError};
pub use secret::serve_secret;
pub use socks5::Socks5Server;
pub use tunnel::TunnelServer;
pub use udp::UdpServer;

use portgate_bridge::BridgeError;
use portgate_proto::TargetError;
use portgate_relay::RelayError;
use portgate_store::StoreError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("port {port} unavailable: {reason}")]
    PortUnavailable { port: u16, reason: String },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("client {0} is disabled")]
    ClientDisabled(i64),

    #[error("no route for host {0}")]
    NoRoute(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running task
///
/// `start` serves until `close` is called and then returns `Ok`. It returns an
/// error only when the service cannot start (bind failure and the like).
/// `close` is idempotent.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> Result<(), ServerError>;

    async fn close(&self) -> Result<(), ServerError>;

    /// Address the service listens on once bound
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
