//! Forward HTTP proxy service (`httpProxy` mode)
//!
//! Egress happens on the client side: every proxied destination is opened as a
//! link through the owning client.

use crate::context::ServerContext;
use crate::http_head::{error_response, read_request_head, RequestHead};
use crate::listener::{accept_loop, bind_tcp, BoundAddr};
use crate::{ServerError, Service};
use http::Uri;
use portgate_bridge::Link;
use portgate_proto::Tunnel;
use portgate_relay::PoolSlot;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

pub struct HttpProxyServer {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
    bound: BoundAddr,
}

/// Destination and what to replay to it
#[derive(Debug, PartialEq, Eq)]
enum ProxyRequest {
    Connect { authority: String },
    Forward { authority: String, head: Vec<u8> },
}

fn parse_proxy_request(mut head: RequestHead) -> Result<ProxyRequest, ServerError> {
    if head.method.eq_ignore_ascii_case("CONNECT") {
        let uri: Uri = head
            .target
            .parse()
            .map_err(|_| ServerError::Protocol(format!("bad CONNECT target {:?}", head.target)))?;
        let authority = uri
            .authority()
            .filter(|a| a.port_u16().is_some())
            .ok_or_else(|| ServerError::Protocol(format!("bad CONNECT target {:?}", head.target)))?;
        return Ok(ProxyRequest::Connect {
            authority: authority.to_string(),
        });
    }

    let uri: Uri = head
        .target
        .parse()
        .map_err(|_| ServerError::Protocol(format!("bad request target {:?}", head.target)))?;
    let authority = match uri.host() {
        Some(host) => format!("{}:{}", host, uri.port_u16().unwrap_or(80)),
        // Origin-form request: fall back to the Host header
        None => {
            let host = head
                .host()
                .ok_or_else(|| ServerError::Protocol("request carries no host".into()))?;
            if host.contains(':') {
                host.to_string()
            } else {
                format!("{}:80", host)
            }
        }
    };
    head.remove_header("proxy-connection");
    head.remove_header("proxy-authorization");
    Ok(ProxyRequest::Forward {
        authority,
        head: head.encode(),
    })
}

impl HttpProxyServer {
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
        let (head, body) = read_request_head(&mut stream).await?;
        let request = match parse_proxy_request(head) {
            Ok(request) => request,
            Err(e) => {
                let _ = stream.write_all(&error_response(400, "Bad Request")).await;
                return Err(e);
            }
        };

        let (authority, reply, preface) = match request {
            ProxyRequest::Connect { authority } => (authority, Some(CONNECT_ESTABLISHED), body),
            ProxyRequest::Forward { authority, mut head } => {
                head.extend_from_slice(&body);
                (authority, None, head)
            }
        };
        debug!(task_id = task.id, %peer, %authority, "Proxy request");

        let link = Link::tcp(authority).with_remote(Some(peer));
        let mut backend = match ctx.dial(&task, link).await {
            Ok(backend) => backend,
            Err(e) => {
                let _ = stream.write_all(&error_response(502, "Bad Gateway")).await;
                return Err(e);
            }
        };
        if let Some(reply) = reply {
            stream.write_all(reply).await?;
        }
        if !preface.is_empty() {
            backend.write_all(&preface).await?;
        }

        ctx.relay_backend(slot, task, stream, Some(peer), backend, admission, &cancel)
            .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for HttpProxyServer {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let listener = bind_tcp(&self.task.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.bound.set(addr);
        info!(task_id = self.task.id, "HTTP proxy listening on {}", addr);

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

        info!(task_id = self.task.id, "HTTP proxy closed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_head::parse_request_head;

    fn request(raw: &str) -> ProxyRequest {
        parse_proxy_request(parse_request_head(raw.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn test_connect_target() {
        assert_eq!(
            request("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"),
            ProxyRequest::Connect {
                authority: "example.com:443".to_string()
            }
        );
    }

    #[test]
    fn test_connect_requires_port() {
        let head = parse_request_head(b"CONNECT example.com HTTP/1.1\r\n\r\n").unwrap();
        assert!(parse_proxy_request(head).is_err());
    }

    #[test]
    fn test_absolute_uri_defaults_to_port_80() {
        let raw = "GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n";
        match request(raw) {
            ProxyRequest::Forward { authority, head } => {
                assert_eq!(authority, "example.com:80");
                let head = String::from_utf8(head).unwrap();
                assert!(head.starts_with("GET http://example.com/index.html HTTP/1.1\r\n"));
                assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_explicit_port_and_host_header_fallback() {
        match request("GET http://example.com:8080/ HTTP/1.1\r\n\r\n") {
            ProxyRequest::Forward { authority, .. } => assert_eq!(authority, "example.com:8080"),
            other => panic!("unexpected request: {other:?}"),
        }
        match request("GET / HTTP/1.1\r\nHost: internal.test:81\r\n\r\n") {
            ProxyRequest::Forward { authority, .. } => assert_eq!(authority, "internal.test:81"),
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
