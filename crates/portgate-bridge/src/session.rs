//! In-process bridge fed by a control-channel transport
//!
//! The transport authenticates a client, then registers a [`LinkOpener`] for it
//! here. From that point the core can open links to the client, and the
//! transport reports control events through the `open_task` / `close_task` /
//! `secret` / `client_gone` calls, which are forwarded to the dispatcher.

use crate::events::{BridgeEvent, SecretSession};
use crate::link::{BoxedStream, Link};
use crate::{Bridge, BridgeError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portgate_proto::Tunnel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opens data streams over one client's control connection
#[async_trait::async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self, link: &Link) -> Result<BoxedStream, BridgeError>;

    /// Tear down the control connection
    async fn close(&self) {}
}

/// Live connection table entry
#[derive(Clone)]
pub struct ClientSession {
    pub client_id: i64,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    opener: Arc<dyn LinkOpener>,
}

pub struct SessionBridge {
    clients: DashMap<i64, ClientSession>,
    events: mpsc::Sender<BridgeEvent>,
}

impl SessionBridge {
    /// Create the bridge and the receiving end of its event channel
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let bridge = Arc::new(Self {
            clients: DashMap::new(),
            events,
        });
        (bridge, rx)
    }

    /// Add a client to the connection table, replacing a stale session
    pub fn register_client(
        &self,
        client_id: i64,
        version: impl Into<String>,
        opener: Arc<dyn LinkOpener>,
    ) -> Option<ClientSession> {
        let session = ClientSession {
            client_id,
            version: version.into(),
            connected_at: Utc::now(),
            opener,
        };
        let replaced = self.clients.insert(client_id, session);
        if replaced.is_some() {
            info!(client_id, "Client re-registered, replaced stale session");
        } else {
            info!(client_id, "Client connected");
        }
        replaced
    }

    pub fn session(&self, client_id: i64) -> Option<ClientSession> {
        self.clients.get(&client_id).map(|s| s.clone())
    }

    /// The transport lost the client: drop it and tell the dispatcher
    pub async fn client_gone(&self, client_id: i64) -> Result<(), BridgeError> {
        if self.clients.remove(&client_id).is_some() {
            info!(client_id, "Client disconnected");
        }
        self.emit(BridgeEvent::CloseClient(client_id)).await
    }

    pub async fn open_task(&self, task: Tunnel) -> Result<(), BridgeError> {
        self.emit(BridgeEvent::OpenTask(task)).await
    }

    pub async fn close_task(&self, task: Tunnel) -> Result<(), BridgeError> {
        self.emit(BridgeEvent::CloseTask(task)).await
    }

    pub async fn secret(&self, session: SecretSession) -> Result<(), BridgeError> {
        self.emit(BridgeEvent::Secret(session)).await
    }

    async fn emit(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        debug!(?event, "Bridge event");
        self.events
            .send(event)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

#[async_trait::async_trait]
impl Bridge for SessionBridge {
    async fn open_link(&self, client_id: i64, link: Link) -> Result<BoxedStream, BridgeError> {
        // Clone the opener out so no table guard is held across the await
        let opener = self
            .clients
            .get(&client_id)
            .map(|s| Arc::clone(&s.opener))
            .ok_or(BridgeError::ClientNotConnected(client_id))?;
        opener.open(&link).await.map_err(|e| {
            warn!(client_id, target = %link.target, "Failed to open link: {}", e);
            e
        })
    }

    fn is_connected(&self, client_id: i64) -> bool {
        self.clients.contains_key(&client_id)
    }

    fn client_version(&self, client_id: i64) -> Option<String> {
        self.clients.get(&client_id).map(|s| s.version.clone())
    }

    fn connected_clients(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.clients.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    async fn disconnect_client(&self, client_id: i64) {
        if let Some((_, session)) = self.clients.remove(&client_id) {
            session.opener.close().await;
            info!(client_id, "Client session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes the link target back on every opened stream
    struct EchoOpener {
        closed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LinkOpener for EchoOpener {
        async fn open(&self, link: &Link) -> Result<BoxedStream, BridgeError> {
            let (ours, mut theirs) = tokio::io::duplex(1024);
            let target = link.target.clone();
            tokio::spawn(async move {
                let _ = theirs.write_all(target.as_bytes()).await;
            });
            Ok(Box::new(ours))
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn opener() -> Arc<EchoOpener> {
        Arc::new(EchoOpener {
            closed: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_open_link_through_registered_client() {
        let (bridge, _rx) = SessionBridge::new(8);
        assert!(matches!(
            bridge.open_link(1, Link::tcp("127.0.0.1:80")).await,
            Err(BridgeError::ClientNotConnected(1))
        ));

        bridge.register_client(1, "0.26.0", opener());
        assert!(bridge.is_connected(1));
        assert_eq!(bridge.client_version(1).as_deref(), Some("0.26.0"));

        let mut stream = bridge
            .open_link(1, Link::new(LinkKind::Tcp, "10.0.0.5:22"))
            .await
            .unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"10.0.0.5:22");
    }

    #[tokio::test]
    async fn test_client_gone_emits_close_client() {
        let (bridge, mut rx) = SessionBridge::new(8);
        bridge.register_client(4, "v", opener());
        bridge.client_gone(4).await.unwrap();

        assert!(!bridge.is_connected(4));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::CloseClient(4))));
    }

    #[tokio::test]
    async fn test_disconnect_closes_opener_once() {
        let (bridge, _rx) = SessionBridge::new(8);
        let op = opener();
        bridge.register_client(2, "v", op.clone());
        bridge.register_client(3, "v", opener());
        assert_eq!(bridge.connected_clients(), vec![2, 3]);

        bridge.disconnect_client(2).await;
        bridge.disconnect_client(2).await;
        assert_eq!(op.closed.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.connected_clients(), vec![3]);
    }

    #[tokio::test]
    async fn test_emit_fails_when_dispatcher_gone() {
        let (bridge, rx) = SessionBridge::new(1);
        drop(rx);
        assert!(matches!(
            bridge.close_task(Tunnel::default()).await,
            Err(BridgeError::ChannelClosed)
        ));
    }
}
