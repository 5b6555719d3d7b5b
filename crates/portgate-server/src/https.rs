//! `https` mode: a host route on the shared listener, no port of its own

use crate::context::ServerContext;
use crate::{ServerError, Service};
use portgate_proto::Tunnel;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct HttpsRouteService {
    task: Arc<Tunnel>,
    ctx: ServerContext,
    cancel: CancellationToken,
}

impl HttpsRouteService {
    pub fn new(task: Arc<Tunnel>, ctx: ServerContext) -> Self {
        Self {
            task,
            ctx,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl Service for HttpsRouteService {
    async fn start(&self) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if !self.ctx.routes.register_task(Arc::clone(&self.task)) {
            return Err(ServerError::NoRoute(self.task.host.clone()));
        }
        info!(task_id = self.task.id, host = %self.task.host, "HTTPS route active");

        self.cancel.cancelled().await;
        self.ctx.routes.unregister_task(self.task.id);
        info!(task_id = self.task.id, host = %self.task.host, "HTTPS route removed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.cancel.cancel();
        Ok(())
    }
}
