//! Control loop consuming bridge events

use crate::orchestrator::Orchestrator;
use crate::ControlError;
use portgate_bridge::BridgeEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns bridge events into registry operations
///
/// Events are handled one at a time, in arrival order. Every handler is
/// short: service startup and secret relays run on their own tasks.
pub struct BridgeDispatcher {
    orchestrator: Arc<Orchestrator>,
    events: mpsc::Receiver<BridgeEvent>,
}

impl BridgeDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, events: mpsc::Receiver<BridgeEvent>) -> Self {
        Self {
            orchestrator,
            events,
        }
    }

    /// Run until cancelled or the bridge drops its sender
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Bridge dispatcher started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        info!("Bridge dispatcher stopped");
    }

    async fn handle(&self, event: BridgeEvent) {
        debug!(?event, "Dispatching bridge event");
        match event {
            BridgeEvent::OpenTask(task) => {
                let id = task.id;
                if let Err(e) = self.orchestrator.add_task(task) {
                    warn!(task_id = id, "Failed to open task: {}", e);
                }
            }
            BridgeEvent::CloseTask(task) => match self.orchestrator.stop_server(task.id).await {
                Ok(()) => {}
                Err(ControlError::NotRunning(id)) => debug!(task_id = id, "Close for idle task"),
                Err(e) => warn!(task_id = task.id, "Failed to close task: {}", e),
            },
            BridgeEvent::CloseClient(client_id) => {
                if let Err(e) = self.orchestrator.close_client(client_id).await {
                    warn!(client_id, "Failed to clean up client: {}", e);
                }
            }
            // Dropping the session on error closes the stream
            BridgeEvent::Secret(session) => {
                if let Err(e) = self.orchestrator.handle_secret(session).await {
                    debug!("Secret session rejected: {}", e);
                }
            }
        }
    }
}
