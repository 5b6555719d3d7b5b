//! Mode to service constructor table

use crate::ControlError;
use portgate_proto::{Mode, Tunnel};
use portgate_server::{
    HttpHostServer, HttpProxyServer, HttpsRouteService, ServerContext, Service, Socks5Server,
    TunnelServer, UdpServer,
};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Builds the `webServer` service; registered by the binary
pub type WebServerFactory = Arc<dyn Fn(Arc<Tunnel>) -> Arc<dyn Service> + Send + Sync>;

#[derive(Default)]
pub struct ModeDispatcher {
    web_server: OnceLock<WebServerFactory>,
}

impl ModeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the `webServer` factory; only the first call takes effect
    pub fn set_web_server(&self, factory: WebServerFactory) -> bool {
        self.web_server.set(factory).is_ok()
    }

    /// Build the service for `task`
    ///
    /// `secret` and `p2p` tasks have no service; the registry keeps a
    /// placeholder for them instead.
    pub fn build(&self, task: Arc<Tunnel>, ctx: &ServerContext) -> Result<Arc<dyn Service>, ControlError> {
        let ctx = ctx.clone();
        let mode = task.mode;
        debug!(task_id = task.id, %mode, "Building service");
        let service: Arc<dyn Service> = match mode {
            Mode::Tcp | Mode::File | Mode::TcpTrans => Arc::new(TunnelServer::new(task, ctx)),
            Mode::HttpProxy => Arc::new(HttpProxyServer::new(task, ctx)),
            Mode::Socks5 => Arc::new(Socks5Server::new(task, ctx)),
            Mode::Udp => Arc::new(UdpServer::new(task, ctx)),
            Mode::HttpHostServer => Arc::new(HttpHostServer::new(task, ctx)),
            Mode::Https => Arc::new(HttpsRouteService::new(task, ctx)),
            Mode::WebServer => match self.web_server.get() {
                Some(factory) => factory(task),
                None => return Err(ControlError::ModeNotSupported(Mode::WebServer)),
            },
            Mode::Secret | Mode::P2p => return Err(ControlError::ModeNotSupported(mode)),
        };
        Ok(service)
    }
}
