//! Read-only JSON status API served by `webServer` tasks
//!
//! Endpoints:
//! - `GET /api/health`
//! - `GET /api/dashboard`: aggregate counters
//! - `GET /api/tunnels`: task listing, query parameters as [`TunnelQuery`]
//! - `GET /api/clients`: client listing, query parameters as [`ClientQuery`]
//!
//! [`TunnelQuery`]: portgate_control::TunnelQuery
//! [`ClientQuery`]: portgate_control::ClientQuery

pub mod handlers;
pub mod models;

use axum::{routing::get, Router};
use portgate_control::{Orchestrator, WebServerFactory};
use portgate_proto::Tunnel;
use portgate_server::listener::bind_tcp;
use portgate_server::{BoundAddr, ServerError, Service};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
///
/// The orchestrator owns the service through its registry, so only a weak
/// handle is kept here.
pub struct AppState {
    pub orchestrator: Weak<Orchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/dashboard", get(handlers::dashboard))
        .route("/api/tunnels", get(handlers::list_tunnels))
        .route("/api/clients", get(handlers::list_clients))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub struct StatusApi {
    task: Arc<Tunnel>,
    state: Arc<AppState>,
    /// Used when the task carries no port of its own
    default_addr: String,
    cancel: CancellationToken,
    bound: BoundAddr,
}

impl StatusApi {
    pub fn new(task: Arc<Tunnel>, orchestrator: Weak<Orchestrator>, default_addr: impl Into<String>) -> Self {
        Self {
            task,
            state: Arc::new(AppState { orchestrator }),
            default_addr: default_addr.into(),
            cancel: CancellationToken::new(),
            bound: BoundAddr::new(),
        }
    }

    /// Constructor to register on the orchestrator's mode dispatcher
    pub fn factory(orchestrator: Weak<Orchestrator>, default_addr: impl Into<String>) -> WebServerFactory {
        let default_addr = default_addr.into();
        Arc::new(move |task: Arc<Tunnel>| {
            Arc::new(StatusApi::new(task, orchestrator.clone(), default_addr.clone())) as Arc<dyn Service>
        })
    }

    pub fn bound(&self) -> &BoundAddr {
        &self.bound
    }

    fn bind_addr(&self) -> String {
        if self.task.port != 0 {
            self.task.bind_addr()
        } else {
            self.default_addr.clone()
        }
    }
}

#[async_trait::async_trait]
impl Service for StatusApi {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let listener = bind_tcp(&self.bind_addr()).await?;
        let local = listener.local_addr()?;
        self.bound.set(local);
        info!(task_id = self.task.id, "Status API listening on http://{}", local);

        axum::serve(listener, build_router(Arc::clone(&self.state)))
            .with_graceful_shutdown(self.cancel.clone().cancelled_owned())
            .await?;
        info!(task_id = self.task.id, "Status API stopped");
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
