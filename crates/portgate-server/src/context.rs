//! Shared collaborators handed to every mode service

use crate::host::HostRoutes;
use crate::ServerError;
use portgate_bridge::{BoxedStream, Bridge, Link, LinkKind};
use portgate_proto::Tunnel;
use portgate_relay::{Admission, ClientRuntimes, PoolSlot, RelayContext, RelayEngine, RelayReport};
use portgate_store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port of the shared Host-header listener; `None` disables it
    pub http_proxy_port: Option<u16>,
    /// Port of the shared SNI listener; `None` disables it
    pub https_proxy_port: Option<u16>,
    /// Listener IP of the shared host listeners
    pub host_bind_ip: String,
    pub udp_idle_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_proxy_port: Some(80),
            https_proxy_port: Some(443),
            host_bind_ip: "0.0.0.0".to_string(),
            udp_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<dyn Store>,
    pub bridge: Arc<dyn Bridge>,
    pub engine: Arc<RelayEngine>,
    pub clients: Arc<ClientRuntimes>,
    pub routes: Arc<HostRoutes>,
    pub settings: ServerSettings,
}

impl ServerContext {
    /// Admit a public connection against the task's owning client
    ///
    /// The client is re-read from storage so edits to its limits apply to the
    /// next connection.
    pub async fn admit(&self, task: &Tunnel, peer: Option<SocketAddr>) -> Result<Admission, ServerError> {
        let client = self.store.get_client(task.client_id).await?;
        if !client.status {
            return Err(ServerError::ClientDisabled(client.id));
        }
        Ok(self.clients.admit(&client, peer)?)
    }

    /// Open the backend side of a connection
    ///
    /// Local-proxy targets are dialed from here; everything else goes through
    /// the owning client.
    pub async fn dial(&self, task: &Tunnel, link: Link) -> Result<BoxedStream, ServerError> {
        if task.target.local_proxy && link.kind == LinkKind::Tcp {
            debug!(task_id = task.id, target = %link.target, "Dialing local proxy target");
            let stream = TcpStream::connect(&link.target).await?;
            return Ok(Box::new(stream));
        }
        Ok(self.bridge.open_link(task.client_id, link).await?)
    }

    /// Dial `link`, send `preface` to the backend, then relay until done
    #[allow(clippy::too_many_arguments)]
    pub async fn relay<P>(
        &self,
        slot: PoolSlot,
        task: Arc<Tunnel>,
        public: P,
        peer: Option<SocketAddr>,
        link: Link,
        preface: &[u8],
        admission: Admission,
        shutdown: &CancellationToken,
    ) -> Result<RelayReport, ServerError>
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut backend = self.dial(&task, link).await?;
        if !preface.is_empty() {
            backend.write_all(preface).await?;
        }
        Ok(self
            .relay_backend(slot, task, public, peer, backend, admission, shutdown)
            .await)
    }

    /// Relay `public` with an already opened backend stream
    #[allow(clippy::too_many_arguments)]
    pub async fn relay_backend<P>(
        &self,
        slot: PoolSlot,
        task: Arc<Tunnel>,
        public: P,
        peer: Option<SocketAddr>,
        backend: BoxedStream,
        admission: Admission,
        shutdown: &CancellationToken,
    ) -> RelayReport
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ctx = RelayContext::new(task)
            .with_admission(admission)
            .with_shutdown(shutdown.clone());
        if let Some(peer) = peer {
            ctx = ctx.with_peer(peer);
        }
        self.engine.relay(slot, public, backend, ctx).await
    }
}
