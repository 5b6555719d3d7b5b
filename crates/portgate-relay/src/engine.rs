//! Pooled bidirectional relay
//!
//! Every accepted connection becomes a relay pair: two copy jobs, one per
//! direction, run on the copy pool and joined before the pair finishes. The
//! pair shares one cancellation token. A read or write error, a short write or
//! an exhausted quota cancels it, which releases the other job even when it is
//! parked on a read. A clean EOF only half-closes the destination so the other
//! direction can drain.

use crate::accountant::TrafficAccountant;
use crate::admission::{Admission, ConnGuard};
use crate::buffer::{BufferPool, COPY_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
use crate::limiter::RateLimiter;
use crate::pool::{PoolSlot, WorkerPool};
use crate::sniff::{sniff_http, HttpSniff};
use crate::RelayError;
use portgate_proto::Tunnel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay pairs served at once
    pub max_pairs: usize,
    /// Directional copy jobs running at once
    pub max_copy_jobs: usize,
    pub buffer_size: usize,
    /// Idle copy buffers kept for reuse
    pub idle_buffers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_pairs: 100_000,
            max_copy_jobs: 200_000,
            buffer_size: COPY_BUFFER_SIZE,
            idle_buffers: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Task and client state a relay pair runs under
pub struct RelayContext {
    pub task: Arc<Tunnel>,
    pub peer: Option<SocketAddr>,
    pub limiter: Option<Arc<RateLimiter>>,
    /// Parent token; cancelling it tears the pair down
    pub shutdown: Option<CancellationToken>,
    guard: Option<ConnGuard>,
}

impl RelayContext {
    pub fn new(task: Arc<Tunnel>) -> Self {
        Self {
            task,
            peer: None,
            limiter: None,
            shutdown: None,
            guard: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Hold the client's connection slot and rate limiter for the pair's lifetime
    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.guard = Some(admission.guard);
        self.limiter = admission.limiter;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions reached EOF
    Completed,
    /// The billed account ran out of quota; not an error
    QuotaExhausted,
    /// An I/O error, a short write or an external shutdown ended the pair
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    /// Bytes copied from the client link to the public connection
    pub to_public: u64,
    /// Bytes copied from the public connection to the client link
    pub to_client: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToClient,
    ToPublic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Eof,
    Cancelled,
    Quota,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct CopyEnd {
    copied: u64,
    reason: EndReason,
}

struct PairState {
    task: Arc<Tunnel>,
    peer: Option<SocketAddr>,
    limiter: Option<Arc<RateLimiter>>,
    accountant: Arc<TrafficAccountant>,
    buffers: Arc<BufferPool>,
    cancel: CancellationToken,
}

pub struct RelayEngine {
    pairs: WorkerPool,
    copies: WorkerPool,
    buffers: Arc<BufferPool>,
    accountant: Arc<TrafficAccountant>,
}

impl RelayEngine {
    pub fn new(config: RelayConfig, accountant: Arc<TrafficAccountant>) -> Self {
        Self {
            pairs: WorkerPool::new("relay-pairs", config.max_pairs),
            copies: WorkerPool::new("copy-jobs", config.max_copy_jobs),
            buffers: BufferPool::new(config.idle_buffers, config.buffer_size),
            accountant,
        }
    }

    pub fn accountant(&self) -> &Arc<TrafficAccountant> {
        &self.accountant
    }

    pub fn active_pairs(&self) -> usize {
        self.pairs.in_use()
    }

    /// Wait for room for one more relay pair
    ///
    /// Accept loops call this before accepting, so a saturated engine stops
    /// accepting instead of queueing connections.
    pub async fn reserve_pair(&self) -> Result<PoolSlot, RelayError> {
        self.pairs.acquire().await
    }

    /// Relay `public` and `link` until both directions finish
    ///
    /// Both streams are dropped exactly once, after both copy jobs returned.
    pub async fn relay<P, L>(
        &self,
        slot: PoolSlot,
        public: P,
        link: L,
        ctx: RelayContext,
    ) -> RelayReport
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let RelayContext {
            task,
            peer,
            limiter,
            shutdown,
            guard,
        } = ctx;
        let cancel = shutdown.map(|t| t.child_token()).unwrap_or_default();
        let pair = Arc::new(PairState {
            task,
            peer,
            limiter,
            accountant: Arc::clone(&self.accountant),
            buffers: Arc::clone(&self.buffers),
            cancel: cancel.clone(),
        });

        let (public_read, public_write) = tokio::io::split(public);
        let (link_read, link_write) = tokio::io::split(link);

        let aborted = RelayReport {
            outcome: RelayOutcome::Aborted,
            to_public: 0,
            to_client: 0,
        };
        let up = match self
            .copies
            .spawn(copy_half(public_read, link_write, Direction::ToClient, Arc::clone(&pair)))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id = pair.task.id, "Relay not started: {}", e);
                return aborted;
            }
        };
        let down = match self
            .copies
            .spawn(copy_half(link_read, public_write, Direction::ToPublic, Arc::clone(&pair)))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(task_id = pair.task.id, "Relay not started: {}", e);
                cancel.cancel();
                let _ = up.await;
                return aborted;
            }
        };

        let (up, down) = tokio::join!(up, down);
        let up = up.unwrap_or(CopyEnd {
            copied: 0,
            reason: EndReason::Failed,
        });
        let down = down.unwrap_or(CopyEnd {
            copied: 0,
            reason: EndReason::Failed,
        });

        let outcome = if up.reason == EndReason::Quota || down.reason == EndReason::Quota {
            RelayOutcome::QuotaExhausted
        } else if up.reason == EndReason::Eof && down.reason == EndReason::Eof {
            RelayOutcome::Completed
        } else {
            RelayOutcome::Aborted
        };
        let report = RelayReport {
            outcome,
            to_public: down.copied,
            to_client: up.copied,
        };
        debug!(
            task_id = pair.task.id,
            peer = ?pair.peer,
            outcome = ?report.outcome,
            to_public = report.to_public,
            to_client = report.to_client,
            "Relay finished"
        );
        drop(guard);
        drop(slot);
        report
    }

    /// Run [`relay`](Self::relay) on its own task
    pub fn spawn_relay<P, L>(
        self: &Arc<Self>,
        slot: PoolSlot,
        public: P,
        link: L,
        ctx: RelayContext,
    ) -> JoinHandle<RelayReport>
    where
        P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.relay(slot, public, link, ctx).await })
    }
}

async fn copy_half<R, W>(mut src: R, mut dst: W, direction: Direction, pair: Arc<PairState>) -> CopyEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pair.buffers.get();
    let mut copied = 0u64;
    let end = |copied, reason| CopyEnd { copied, reason };

    loop {
        let read = tokio::select! {
            biased;
            _ = pair.cancel.cancelled() => return end(copied, EndReason::Cancelled),
            read = src.read(&mut buf[..]) => read,
        };
        let n = match read {
            Ok(0) => {
                let _ = dst.shutdown().await;
                return end(copied, EndReason::Eof);
            }
            Ok(n) => n,
            Err(e) => {
                trace!(task_id = pair.task.id, ?direction, "Relay read failed: {}", e);
                pair.cancel.cancel();
                return end(copied, EndReason::Failed);
            }
        };
        let data = &buf[..n];

        if direction == Direction::ToPublic {
            let sniffed = sniff_http(data);
            pair.task.is_http.set(sniffed.is_some());
            if let Some(HttpSniff::Request(Some(line))) = sniffed {
                debug!(
                    task_id = pair.task.id,
                    peer = ?pair.peer,
                    target = %pair.task.target.target_str,
                    "HTTP request {}",
                    line
                );
            }
        }

        if let Some(limiter) = &pair.limiter {
            limiter.consume(n).await;
        }

        let written = tokio::select! {
            biased;
            _ = pair.cancel.cancelled() => return end(copied, EndReason::Cancelled),
            written = dst.write_all(data) => written,
        };
        if let Err(e) = written {
            trace!(task_id = pair.task.id, ?direction, "Relay write failed: {}", e);
            pair.cancel.cancel();
            return end(copied, EndReason::Failed);
        }
        copied += n as u64;

        match direction {
            Direction::ToPublic => pair.task.flow.add(0, n as i64),
            Direction::ToClient => pair.task.flow.add(n as i64, 0),
        }

        if direction == Direction::ToPublic && pair.task.is_billable() {
            let account_id = pair.task.account_id;
            pair.accountant.accumulate(account_id, n as i64);
            if pair.accountant.remaining(account_id).await <= 0 {
                info!(
                    task_id = pair.task.id,
                    account_id,
                    pending = pair.accountant.pending(account_id),
                    "Flow quota exhausted, closing relay"
                );
                pair.cancel.cancel();
                return end(copied, EndReason::Quota);
            }
        }
    }
}
