//! SOCKS5 service (`socks5` mode)
//!
//! RFC 1928 `CONNECT` only; username/password authentication (RFC 1929) is
//! required when the task carries a multi-account map. Destinations are opened
//! through the owning client.

use crate::context::ServerContext;
use crate::listener::{accept_loop, bind_tcp, BoundAddr};
use crate::{ServerError, Service};
use portgate_bridge::Link;
use portgate_proto::{MultiAccount, Tunnel};
use portgate_relay::PoolSlot;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_NOT_SUPPORTED: u8 = 0x08;
}

pub struct Socks5Server {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
    bound: BoundAddr,
}

fn accounts(task: &Tunnel) -> Option<&MultiAccount> {
    task.multi_account.as_ref().filter(|m| !m.accounts.is_empty())
}

async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    // Bound address is not meaningful for a tunneled connect
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Method negotiation and, when required, username/password authentication
async fn negotiate<S>(stream: &mut S, accounts: Option<&MultiAccount>) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ServerError::Protocol(format!("unsupported SOCKS version {}", header[0])));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if accounts.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(ServerError::Protocol("no acceptable authentication method".into()));
    }
    stream.write_all(&[VERSION, wanted]).await?;

    if let Some(accounts) = accounts {
        let mut version = [0u8; 1];
        stream.read_exact(&mut version).await?;
        if version[0] != AUTH_VERSION {
            return Err(ServerError::Protocol("unsupported auth version".into()));
        }
        let user = read_short_string(stream).await?;
        let password = read_short_string(stream).await?;
        if !accounts.verify(&user, &password) {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(ServerError::Protocol(format!("authentication failed for {:?}", user)));
        }
        stream.write_all(&[AUTH_VERSION, 0x00]).await?;
    }
    Ok(())
}

async fn read_short_string<S>(stream: &mut S) -> Result<String, ServerError>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; len[0] as usize];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ServerError::Protocol("invalid UTF-8 string".into()))
}

/// Read the request and return the `host:port` to connect to
///
/// Unsupported commands and address types are answered before erroring.
async fn read_request<S>(stream: &mut S) -> Result<String, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _, atyp] = header;
    if version != VERSION {
        return Err(ServerError::Protocol(format!("unsupported SOCKS version {}", version)));
    }
    if cmd != CMD_CONNECT {
        send_reply(stream, reply::COMMAND_NOT_SUPPORTED).await?;
        return Err(ServerError::Protocol(format!("unsupported SOCKS command {}", cmd)));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => read_short_string(stream).await?,
        other => {
            send_reply(stream, reply::ADDRESS_NOT_SUPPORTED).await?;
            return Err(ServerError::Protocol(format!("unsupported address type {}", other)));
        }
    };
    let port = stream.read_u16().await?;
    Ok(format!("{}:{}", host, port))
}

impl Socks5Server {
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

    async fn handle(
        task: Arc<Tunnel>,
        ctx: ServerContext,
        cancel: CancellationToken,
        mut stream: TcpStream,
        peer: SocketAddr,
        slot: PoolSlot,
    ) -> Result<(), ServerError> {
        let admission = ctx.admit(&task, Some(peer)).await?;
        negotiate(&mut stream, accounts(&task)).await?;
        let destination = read_request(&mut stream).await?;
        debug!(task_id = task.id, %peer, %destination, "SOCKS5 connect");

        let link = Link::tcp(destination).with_remote(Some(peer));
        let backend = match ctx.dial(&task, link).await {
            Ok(backend) => backend,
            Err(e) => {
                let code = match e {
                    ServerError::Io(_) => reply::HOST_UNREACHABLE,
                    _ => reply::GENERAL_FAILURE,
                };
                let _ = send_reply(&mut stream, code).await;
                return Err(e);
            }
        };
        send_reply(&mut stream, reply::SUCCEEDED).await?;

        ctx.relay_backend(slot, task, stream, Some(peer), backend, admission, &cancel)
            .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for Socks5Server {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let listener = bind_tcp(&self.task.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.bound.set(addr);
        info!(task_id = self.task.id, "SOCKS5 server listening on {}", addr);

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

        info!(task_id = self.task.id, "SOCKS5 server closed");
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
