//! UDP forwarding service (`udp` mode)
//!
//! Each public peer address gets its own session: one link through the owning
//! client, carrying datagrams as 16-bit length-prefixed frames. Sessions end
//! after an idle period, on link failure, or when the account runs out of
//! quota.

use crate::context::ServerContext;
use crate::listener::{bind_udp, BoundAddr};
use crate::{ServerError, Service};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use portgate_bridge::{BoxedStream, Link, LinkKind};
use portgate_proto::Tunnel;
use portgate_relay::Admission;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;
const SESSION_QUEUE: usize = 256;

/// Frame codec of a UDP link
pub fn datagram_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(MAX_DATAGRAM)
        .new_codec()
}

type Sessions = DashMap<SocketAddr, mpsc::Sender<Bytes>>;

pub struct UdpServer {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
    bound: BoundAddr,
    sessions: Arc<Sessions>,
}

impl UdpServer {
    pub fn new(task: Arc<Tunnel>, ctx: ServerContext) -> Self {
        Self {
            task,
            ctx,
            cancel: CancellationToken::new(),
            bound: BoundAddr::new(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn bound(&self) -> &BoundAddr {
        &self.bound
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a session for `peer` and opens its link in the background.
    /// Datagrams queue on the session while the link is being opened.
    fn open_session(&self, socket: &Arc<UdpSocket>, peer: SocketAddr) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        self.sessions.insert(peer, tx.clone());
        let session = Session {
            task: Arc::clone(&self.task),
            ctx: self.ctx.clone(),
            socket: Arc::clone(socket),
            peer,
            cancel: self.cancel.child_token(),
        };
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            session.establish(rx).await;
            sessions.remove_if(&peer, |_, tx| tx.is_closed());
        });
        tx
    }
}

struct Session {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl Session {
    async fn establish(self, inbound: mpsc::Receiver<Bytes>) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            opened = self.open_link() => opened,
        };
        match opened {
            Ok((admission, stream)) => {
                self.run(admission, Framed::new(stream, datagram_codec()), inbound)
                    .await
            }
            Err(e) => debug!(task_id = self.task.id, peer = %self.peer, "UDP session refused: {}", e),
        }
    }

    async fn open_link(&self) -> Result<(Admission, BoxedStream), ServerError> {
        let admission = self.ctx.admit(&self.task, Some(self.peer)).await?;
        let target = self.task.target.select()?;
        let link = Link::new(LinkKind::Udp, target).with_remote(Some(self.peer));
        let stream = self.ctx.dial(&self.task, link).await?;
        Ok((admission, stream))
    }

    async fn run<S>(
        self,
        admission: Admission,
        mut link: Framed<S, LengthDelimitedCodec>,
        mut inbound: mpsc::Receiver<Bytes>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let task_id = self.task.id;
        let idle = self.ctx.settings.udp_idle_timeout;
        let accountant = Arc::clone(self.ctx.engine.accountant());
        let limiter = admission.limiter.clone();
        let mut deadline = Instant::now() + idle;
        debug!(task_id, peer = %self.peer, "UDP session opened");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(task_id, peer = %self.peer, "UDP session idle, closing");
                    break;
                }
                datagram = inbound.recv() => {
                    let Some(datagram) = datagram else { break };
                    if let Some(limiter) = &limiter {
                        limiter.consume(datagram.len()).await;
                    }
                    self.task.flow.add(datagram.len() as i64, 0);
                    if let Err(e) = link.send(datagram).await {
                        warn!(task_id, peer = %self.peer, "UDP link write failed: {}", e);
                        break;
                    }
                    deadline = Instant::now() + idle;
                }
                frame = link.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!(task_id, peer = %self.peer, "UDP link read failed: {}", e);
                            break;
                        }
                        None => break,
                    };
                    if let Some(limiter) = &limiter {
                        limiter.consume(frame.len()).await;
                    }
                    if let Err(e) = self.socket.send_to(&frame, self.peer).await {
                        warn!(task_id, peer = %self.peer, "UDP send failed: {}", e);
                        break;
                    }
                    self.task.flow.add(0, frame.len() as i64);
                    deadline = Instant::now() + idle;

                    if self.task.is_billable() {
                        accountant.accumulate(self.task.account_id, frame.len() as i64);
                        if accountant.remaining(self.task.account_id).await <= 0 {
                            info!(task_id, account_id = self.task.account_id, "UDP session closed, flow quota exhausted");
                            break;
                        }
                    }
                }
            }
        }
        debug!(task_id, peer = %self.peer, "UDP session closed");
    }
}

#[async_trait::async_trait]
impl Service for UdpServer {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let socket = Arc::new(bind_udp(&self.task.bind_addr()).await?);
        let addr = socket.local_addr()?;
        self.bound.set(addr);
        info!(task_id = self.task.id, "UDP server listening on {}", addr);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(task_id = self.task.id, "UDP receive failed: {}", e);
                        continue;
                    }
                },
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            let existing = self.sessions.get(&peer).map(|tx| tx.clone());
            let tx = match existing {
                Some(tx) if !tx.is_closed() => tx,
                _ => self.open_session(&socket, peer),
            };
            // A full session queue drops the datagram, as the network would
            if tx.try_send(datagram).is_err() {
                debug!(task_id = self.task.id, %peer, "UDP session queue full, dropping datagram");
            }
        }

        self.sessions.clear();
        info!(task_id = self.task.id, "UDP server closed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.cancel.cancel();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get()
    }
}
