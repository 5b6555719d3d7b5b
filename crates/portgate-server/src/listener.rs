//! Listener helpers shared by the accepting services

use crate::ServerError;
use portgate_relay::{PoolSlot, RelayEngine};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BIND_ATTEMPTS: u32 = 3;

/// Bind a TCP listener, retrying while the port sits in TIME_WAIT
pub async fn bind_tcp(addr: &str) -> Result<TcpListener, ServerError> {
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound {} on attempt {}/{}", addr, attempt, BIND_ATTEMPTS);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "{} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in 1 second...",
                    addr, attempt, BIND_ATTEMPTS
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ServerError::Bind {
                    address: addr.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    Err(ServerError::Bind {
        address: addr.to_string(),
        reason: format!("address in use after {} attempts", BIND_ATTEMPTS),
    })
}

pub async fn bind_udp(addr: &str) -> Result<UdpSocket, ServerError> {
    UdpSocket::bind(addr).await.map_err(|e| ServerError::Bind {
        address: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Address a service ended up listening on, published once bound
#[derive(Debug)]
pub struct BoundAddr(watch::Sender<Option<SocketAddr>>);

impl BoundAddr {
    pub fn new() -> Self {
        Self(watch::channel(None).0)
    }

    pub fn set(&self, addr: SocketAddr) {
        self.0.send_replace(Some(addr));
    }

    pub fn get(&self) -> Option<SocketAddr> {
        *self.0.borrow()
    }

    /// Wait until the service is bound
    pub async fn wait(&self) -> Option<SocketAddr> {
        let mut rx = self.0.subscribe();
        let bound = rx.wait_for(Option::is_some).await.ok()?;
        *bound
    }
}

impl Default for BoundAddr {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept connections until `cancel` fires
///
/// A relay pair slot is reserved before each accept, so a saturated engine
/// stops accepting rather than queueing sockets. Each connection is handled on
/// its own task; handler errors end that connection only.
pub async fn accept_loop<F, Fut>(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    cancel: CancellationToken,
    task_id: i64,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr, PoolSlot) -> Fut,
    Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    loop {
        let slot = tokio::select! {
            _ = cancel.cancelled() => break,
            slot = engine.reserve_pair() => match slot {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(task_id, "Relay pool unavailable, stopping accept loop: {}", e);
                    break;
                }
            },
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(task_id, "Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        debug!(task_id, %peer, "Accepted connection");

        let conn = handler(stream, peer, slot);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(task_id, %peer, "Connection ended: {}", e);
            }
        });
    }
    debug!(task_id, "Accept loop stopped");
}
