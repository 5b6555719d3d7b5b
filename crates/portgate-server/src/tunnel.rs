//! Port-forwarding service for `tcp`, `file` and `tcpTrans` tasks

use crate::context::ServerContext;
use crate::listener::{accept_loop, bind_tcp, BoundAddr};
use crate::{ServerError, Service};
use portgate_bridge::{Link, LinkKind};
use portgate_proto::{Mode, Tunnel};
use portgate_relay::{PoolSlot, RelayOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct TunnelServer {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
    bound: BoundAddr,
}

impl TunnelServer {
    pub fn new(task: Arc<Tunnel>, ctx: ServerContext) -> Self {
        Self {
            task,
            ctx,
            cancel: CancellationToken::new(),
            bound: BoundAddr::new(),
        }
    }

    pub fn bound(&self) -> &BoundAddr {
        &self.bound
    }

    /// Backend link for one accepted connection
    fn link_for(task: &Tunnel, peer: SocketAddr) -> Result<Link, ServerError> {
        let link = match task.mode {
            Mode::File => Link::new(LinkKind::File, task.local_path.clone()),
            _ => Link::tcp(task.target.select()?),
        };
        Ok(link.with_remote(Some(peer)))
    }

    async fn handle(
        task: Arc<Tunnel>,
        ctx: ServerContext,
        cancel: CancellationToken,
        stream: TcpStream,
        peer: SocketAddr,
        slot: PoolSlot,
    ) -> Result<(), ServerError> {
        let admission = ctx.admit(&task, Some(peer)).await?;
        let link = Self::link_for(&task, peer)?;
        debug!(task_id = task.id, %peer, target = %link.target, "Opening link");

        let report = ctx
            .relay(slot, Arc::clone(&task), stream, Some(peer), link, &[], admission, &cancel)
            .await?;
        if report.outcome == RelayOutcome::QuotaExhausted {
            info!(task_id = task.id, account_id = task.account_id, "Connection closed, flow quota exhausted");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for TunnelServer {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let listener = bind_tcp(&self.task.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.bound.set(addr);
        info!(task_id = self.task.id, mode = %self.task.mode, "Tunnel listening on {}", addr);

        let task = Arc::clone(&self.task);
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        accept_loop(
            listener,
            Arc::clone(&self.ctx.engine),
            self.cancel.clone(),
            self.task.id,
            move |stream, peer, slot| {
                Self::handle(Arc::clone(&task), ctx.clone(), cancel.clone(), stream, peer, slot)
            },
        )
        .await;

        info!(task_id = self.task.id, "Tunnel listener closed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        debug!(task_id = self.task.id, "Closing tunnel");
        self.cancel.cancel();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get()
    }
}
