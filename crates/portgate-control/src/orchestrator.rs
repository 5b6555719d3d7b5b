//! Registry of running tasks and their lifecycle
//!
//! Registry membership is the only source of truth for whether a task is
//! serving. Entries are inserted through the map's entry API so one id never
//! holds two live handles, and removed before their service is closed so each
//! handle is closed by exactly one caller.

use crate::dispatch::ModeDispatcher;
use crate::ControlError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portgate_bridge::{Bridge, SecretSession};
use portgate_proto::{Mode, Tunnel};
use portgate_server::{serve_secret, PortPolicy, ServerContext, Service};
use portgate_store::{Store, StoreError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A registry entry
#[derive(Clone)]
pub struct RunningTask {
    pub tunnel: Arc<Tunnel>,
    /// `None` for `secret`/`p2p` placeholders
    service: Option<Arc<dyn Service>>,
    pub started_at: DateTime<Utc>,
}

impl RunningTask {
    pub fn is_placeholder(&self) -> bool {
        self.service.is_none()
    }

    /// Address the task's service is bound to, once it is listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.service.as_ref().and_then(|s| s.local_addr())
    }

    fn holds(&self, service: &Arc<dyn Service>) -> bool {
        self.service
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, service))
    }
}

pub struct Orchestrator {
    ctx: ServerContext,
    ports: PortPolicy,
    dispatcher: ModeDispatcher,
    running: Arc<DashMap<i64, RunningTask>>,
    /// Parent of every secret relay the orchestrator spawns
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: ServerContext, ports: PortPolicy) -> Self {
        Self {
            ctx,
            ports,
            dispatcher: ModeDispatcher::new(),
            running: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.ctx.store
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.ctx.bridge
    }

    pub fn dispatcher(&self) -> &ModeDispatcher {
        &self.dispatcher
    }

    pub fn is_running(&self, id: i64) -> bool {
        self.running.contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_task(&self, id: i64) -> Option<RunningTask> {
        self.running.get(&id).map(|r| r.clone())
    }

    pub fn running_tasks(&self) -> Vec<RunningTask> {
        let mut tasks: Vec<RunningTask> = self.running.iter().map(|r| r.clone()).collect();
        tasks.sort_by_key(|r| r.tunnel.id);
        tasks
    }

    /// Put `task` in the registry and start serving it
    ///
    /// `secret`/`p2p` tasks only get a placeholder. Other modes are probed for
    /// their port first (except those sharing a listener), then their service
    /// starts on its own task. A start failure removes the entry again and is
    /// only logged.
    pub fn add_task(&self, task: Tunnel) -> Result<(), ControlError> {
        let id = task.id;
        let mode = task.mode;
        let task = Arc::new(task);

        if mode.is_portless() {
            return match self.running.entry(id) {
                Entry::Occupied(_) => Err(ControlError::AlreadyRunning(id)),
                Entry::Vacant(slot) => {
                    slot.insert(RunningTask {
                        tunnel: task,
                        service: None,
                        started_at: Utc::now(),
                    });
                    info!(task_id = id, %mode, "Task registered, awaiting secret handshake");
                    Ok(())
                }
            };
        }

        if self.running.contains_key(&id) {
            return Err(ControlError::AlreadyRunning(id));
        }
        if !mode.skips_port_probe() {
            self.ports.check(mode, task.port)?;
        }
        let service = self.dispatcher.build(Arc::clone(&task), &self.ctx)?;

        match self.running.entry(id) {
            Entry::Occupied(_) => return Err(ControlError::AlreadyRunning(id)),
            Entry::Vacant(slot) => {
                slot.insert(RunningTask {
                    tunnel: Arc::clone(&task),
                    service: Some(Arc::clone(&service)),
                    started_at: Utc::now(),
                });
            }
        }
        info!(task_id = id, %mode, port = task.port, "Task added");

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            match service.start().await {
                Ok(()) => debug!(task_id = id, "Task service stopped"),
                Err(e) => {
                    error!(task_id = id, "Task failed to start: {}", e);
                    running.remove_if(&id, |_, entry| entry.holds(&service));
                }
            }
        });
        Ok(())
    }

    /// Load a persisted task, serve it and mark it enabled
    pub async fn start_task(&self, id: i64) -> Result<(), ControlError> {
        let mut task = self.ctx.store.get_task(id).await?;
        self.add_task(task.clone())?;
        task.status = true;
        self.ctx.store.update_task(&task).await?;
        Ok(())
    }

    /// Stop a running task and mark it disabled
    ///
    /// The entry is removed before `close`, so it is gone even when closing
    /// fails, and a concurrent stop sees `NotRunning`.
    pub async fn stop_server(&self, id: i64) -> Result<(), ControlError> {
        let (_, entry) = self
            .running
            .remove(&id)
            .ok_or(ControlError::NotRunning(id))?;
        let closed = match &entry.service {
            Some(service) => service.close().await,
            None => Ok(()),
        };
        info!(task_id = id, "Task stopped");

        match self.ctx.store.get_task(id).await {
            Ok(mut task) => {
                task.status = false;
                if let Err(e) = self.ctx.store.update_task(&task).await {
                    warn!(task_id = id, "Failed to persist stopped status: {}", e);
                }
            }
            Err(StoreError::TaskNotFound(_)) => {}
            Err(e) => warn!(task_id = id, "Failed to load stopped task: {}", e),
        }

        closed.map_err(ControlError::from)
    }

    /// Stop a task if it runs, then delete its record
    pub async fn del_task(&self, id: i64) -> Result<(), ControlError> {
        match self.stop_server(id).await {
            Ok(()) | Err(ControlError::NotRunning(_)) => {}
            Err(e) => warn!(task_id = id, "Error while stopping deleted task: {}", e),
        }
        self.ctx.store.del_task(id).await?;
        info!(task_id = id, "Task deleted");
        Ok(())
    }

    /// Persist a new task and serve it
    ///
    /// `https` tasks are persisted only; they join host routing when started.
    pub async fn create_task(&self, mut task: Tunnel) -> Result<i64, ControlError> {
        let client = match self.ctx.store.get_client(task.client_id).await {
            Ok(client) => client,
            Err(StoreError::ClientNotFound(id)) => return Err(ControlError::ClientNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if client.max_tunnel_num > 0 {
            let owned = self.ctx.store.tasks_by_client(client.id).await?.len()
                + self.ctx.store.hosts_by_client(client.id).await?.len();
            if !client.has_tunnel_capacity(owned) {
                return Err(ControlError::TunnelLimitExceeded {
                    client_id: client.id,
                    max: client.max_tunnel_num,
                });
            }
        }
        if !task.mode.skips_port_probe() {
            self.ports.check(task.mode, task.port)?;
        }

        task.id = 0;
        task.id = self.ctx.store.new_task(task.clone()).await?;
        info!(task_id = task.id, client_id = task.client_id, mode = %task.mode, "Task created");

        let id = task.id;
        if task.mode != Mode::Https && task.status {
            self.add_task(task)?;
        }
        Ok(id)
    }

    /// Restart a task from its persisted record after an edit
    pub async fn reload_task(&self, id: i64) -> Result<(), ControlError> {
        match self.stop_server(id).await {
            Ok(()) | Err(ControlError::NotRunning(_)) => {}
            Err(e) => warn!(task_id = id, "Error while stopping reloaded task: {}", e),
        }
        self.start_task(id).await
    }

    /// Serve every enabled persisted task; returns how many were added
    pub async fn init_from_store(&self) -> Result<usize, ControlError> {
        let mut added = 0;
        for task in self.ctx.store.all_tasks().await? {
            if !task.status {
                continue;
            }
            let id = task.id;
            match self.add_task(task) {
                Ok(()) => added += 1,
                Err(e) => error!(task_id = id, "Failed to start task at boot: {}", e),
            }
        }
        info!(added, "Tasks loaded from store");
        Ok(added)
    }

    /// Tear down everything the client left behind
    ///
    /// Ephemeral (`no_store`) tasks other than `secret` ones and ephemeral
    /// hosts are deleted; the client's connection entry is dropped, and an
    /// ephemeral client record is deleted too. Persistent tasks stay as they
    /// are.
    pub async fn close_client(&self, client_id: i64) -> Result<(), ControlError> {
        for task in self.ctx.store.tasks_by_client(client_id).await? {
            if task.no_store && task.mode != Mode::Secret {
                if let Err(e) = self.del_task(task.id).await {
                    warn!(task_id = task.id, client_id, "Failed to delete ephemeral task: {}", e);
                }
            }
        }
        for host in self.ctx.store.hosts_by_client(client_id).await? {
            if host.no_store {
                self.ctx.routes.forget_host(host.id);
                if let Err(e) = self.ctx.store.del_host(host.id).await {
                    warn!(host_id = host.id, client_id, "Failed to delete ephemeral host: {}", e);
                }
            }
        }

        self.ctx.bridge.disconnect_client(client_id).await;

        match self.ctx.store.get_client(client_id).await {
            Ok(client) if client.no_store => {
                self.ctx.store.del_client(client_id).await?;
                self.ctx.clients.forget(client_id);
                info!(client_id, "Ephemeral client deleted");
            }
            Ok(_) | Err(StoreError::ClientNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Hand a secret-mode stream to the task owning the presented password
    ///
    /// The relay runs on its own task. Unknown passwords and disabled tasks
    /// drop the stream.
    pub async fn handle_secret(&self, session: SecretSession) -> Result<(), ControlError> {
        let found = self
            .ctx
            .store
            .task_by_password_md5(&session.password_md5)
            .await?;
        let Some(task) = found else {
            warn!(peer = ?session.remote_addr, "Secret handshake with unknown password");
            return Err(ControlError::PasswordNotFound);
        };
        if !task.status {
            warn!(task_id = task.id, "Secret handshake for disabled task");
            return Err(ControlError::TaskDisabled(task.id));
        }

        // Prefer the registered instance so its flow counters stay live
        let task = match self.running.get(&task.id) {
            Some(entry) => Arc::clone(&entry.tunnel),
            None => Arc::new(task),
        };
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let task_id = task.id;
            match serve_secret(&ctx, task, session, &shutdown).await {
                Ok(report) => debug!(task_id, outcome = ?report.outcome, "Secret relay finished"),
                Err(e) => warn!(task_id, "Secret relay failed: {}", e),
            }
        });
        Ok(())
    }

    /// Close every running service without touching persisted status
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<i64> = self.running.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.running.remove(&id) {
                if let Some(service) = entry.service {
                    if let Err(e) = service.close().await {
                        warn!(task_id = id, "Error closing task: {}", e);
                    }
                }
            }
        }
        info!("All tasks closed");
    }
}
