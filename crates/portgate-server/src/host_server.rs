//! Shared virtual host listeners (`httpHostServer` mode)
//!
//! The HTTP side routes on the `Host` header of the first request and applies
//! the route's host and header rewrites. The HTTPS side routes on the TLS SNI
//! name and passes the encrypted stream through untouched.

use crate::context::ServerContext;
use crate::host::RouteMatch;
use crate::http_head::{error_response, read_request_head, RequestHead};
use crate::listener::{accept_loop, bind_tcp, BoundAddr};
use crate::sni::{extract_sni, read_client_hello};
use crate::{ServerError, Service};
use portgate_bridge::Link;
use portgate_proto::Tunnel;
use portgate_relay::PoolSlot;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpHostServer {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
    http_bound: BoundAddr,
    https_bound: BoundAddr,
}

/// Apply a route's host and header rewrites to a request head
///
/// `header_change` holds one `Name: value` pair per line.
pub fn rewrite_request(head: &mut RequestHead, task: &Tunnel, peer: SocketAddr) {
    if !task.host_change.is_empty() {
        head.set_header("Host", task.host_change.clone());
    }
    for line in task.header_change.lines() {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() {
                head.set_header(name, value.trim());
            }
        }
    }
    let ip = peer.ip().to_string();
    let forwarded = match head.header("X-Forwarded-For") {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip.clone(),
    };
    head.set_header("X-Forwarded-For", forwarded);
    head.set_header("X-Real-IP", ip);
}

impl HttpHostServer {
    pub fn new(task: Arc<Tunnel>, ctx: ServerContext) -> Self {
        Self {
            task,
            ctx,
            cancel: CancellationToken::new(),
            http_bound: BoundAddr::new(),
            https_bound: BoundAddr::new(),
        }
    }

    pub fn http_bound(&self) -> &BoundAddr {
        &self.http_bound
    }

    pub fn https_bound(&self) -> &BoundAddr {
        &self.https_bound
    }

    async fn handle_http(
        ctx: ServerContext,
        cancel: CancellationToken,
        mut stream: TcpStream,
        peer: SocketAddr,
        slot: PoolSlot,
    ) -> Result<(), ServerError> {
        let (mut head, body) = read_request_head(&mut stream).await?;
        let host = match head.host() {
            Some(host) => host.to_string(),
            None => {
                let _ = stream.write_all(&error_response(400, "Bad Request")).await;
                return Err(ServerError::Protocol("request carries no Host header".into()));
            }
        };
        let Some(RouteMatch { task, .. }) = ctx.routes.resolve(&host, head.path(), "http").await else {
            let _ = stream.write_all(&error_response(404, "Not Found")).await;
            return Err(ServerError::NoRoute(host));
        };

        let admission = match ctx.admit(&task, Some(peer)).await {
            Ok(admission) => admission,
            Err(e) => {
                let _ = stream.write_all(&error_response(503, "Service Unavailable")).await;
                return Err(e);
            }
        };
        rewrite_request(&mut head, &task, peer);
        let target = task.target.select()?;
        debug!(task_id = task.id, %peer, %host, %target, "Routing HTTP request");

        let mut preface = head.encode();
        preface.extend_from_slice(&body);
        let link = Link::tcp(target).with_remote(Some(peer));
        let mut backend = match ctx.dial(&task, link).await {
            Ok(backend) => backend,
            Err(e) => {
                let _ = stream.write_all(&error_response(502, "Bad Gateway")).await;
                return Err(e);
            }
        };
        backend.write_all(&preface).await?;

        ctx.relay_backend(slot, task, stream, Some(peer), backend, admission, &cancel)
            .await;
        Ok(())
    }

    async fn handle_https(
        ctx: ServerContext,
        cancel: CancellationToken,
        mut stream: TcpStream,
        peer: SocketAddr,
        slot: PoolSlot,
    ) -> Result<(), ServerError> {
        let hello = read_client_hello(&mut stream, CLIENT_HELLO_TIMEOUT).await?;
        let host = extract_sni(&hello).map_err(|e| ServerError::Protocol(e.to_string()))?;
        let RouteMatch { task, .. } = ctx
            .routes
            .resolve(&host, "/", "https")
            .await
            .ok_or_else(|| ServerError::NoRoute(host.clone()))?;

        let admission = ctx.admit(&task, Some(peer)).await?;
        let target = task.target.select()?;
        debug!(task_id = task.id, %peer, %host, %target, "Routing TLS connection");

        let link = Link::tcp(target).with_remote(Some(peer));
        ctx.relay(slot, task, stream, Some(peer), link, &hello, admission, &cancel)
            .await?;
        Ok(())
    }

    async fn serve_http(&self, port: u16) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.ctx.settings.host_bind_ip, port);
        let listener = bind_tcp(&addr).await?;
        let local = listener.local_addr()?;
        self.http_bound.set(local);
        info!(task_id = self.task.id, "HTTP host listener on {}", local);

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        accept_loop(
            listener,
            Arc::clone(&self.ctx.engine),
            self.cancel.clone(),
            self.task.id,
            move |stream, peer, slot| Self::handle_http(ctx.clone(), cancel.clone(), stream, peer, slot),
        )
        .await;
        Ok(())
    }

    async fn serve_https(&self, port: u16) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.ctx.settings.host_bind_ip, port);
        let listener = bind_tcp(&addr).await?;
        let local = listener.local_addr()?;
        self.https_bound.set(local);
        info!(task_id = self.task.id, "HTTPS host listener on {}", local);

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        accept_loop(
            listener,
            Arc::clone(&self.ctx.engine),
            self.cancel.clone(),
            self.task.id,
            move |stream, peer, slot| Self::handle_https(ctx.clone(), cancel.clone(), stream, peer, slot),
        )
        .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for HttpHostServer {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let http = async {
            match self.ctx.settings.http_proxy_port {
                Some(port) => self.serve_http(port).await,
                None => Ok(()),
            }
        };
        let https = async {
            match self.ctx.settings.https_proxy_port {
                Some(port) => self.serve_https(port).await,
                None => Ok(()),
            }
        };
        // A side failing to bind drops the other listener with it
        let result = tokio::try_join!(http, https);

        info!(task_id = self.task.id, "Host listeners closed");
        result.map(|_| ())
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.cancel.cancel();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.http_bound.get().or_else(|| self.https_bound.get())
    }
}
