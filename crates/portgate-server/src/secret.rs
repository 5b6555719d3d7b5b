//! Serving a secret-mode stream handed over by the bridge

use crate::context::ServerContext;
use crate::ServerError;
use portgate_bridge::{Link, SecretSession};
use portgate_proto::Tunnel;
use portgate_relay::RelayReport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Relay an already authenticated secret stream to the task's target
///
/// The stream stands in for an accepted public connection: it is admitted
/// against the owning client, then relayed like any other pair.
pub async fn serve_secret(
    ctx: &ServerContext,
    task: Arc<Tunnel>,
    session: SecretSession,
    shutdown: &CancellationToken,
) -> Result<RelayReport, ServerError> {
    let SecretSession {
        stream,
        remote_addr,
        ..
    } = session;
    let admission = ctx.admit(&task, remote_addr).await?;
    let target = task.target.select()?;
    debug!(task_id = task.id, peer = ?remote_addr, %target, "Serving secret stream");

    let slot = ctx.engine.reserve_pair().await?;
    let link = Link::tcp(target).with_remote(remote_addr);
    ctx.relay(slot, task, stream, remote_addr, link, &[], admission, shutdown)
        .await
}
