//! Periodic backend health probing
//!
//! Each running task with health settings is probed on its own interval. A
//! target failing `max_fail` consecutive probes is taken out of the task's
//! round-robin rotation; its next successful probe puts it back.

use crate::orchestrator::Orchestrator;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use portgate_proto::{Health, HealthCheckType, Tunnel};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
enum ProbeError {
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("timed out")]
    Timeout,
}

struct TaskHealth {
    /// Instance the counters belong to; a restarted task starts over
    tunnel: Arc<Tunnel>,
    next_check: Instant,
    failures: HashMap<String, u32>,
}

pub struct HealthChecker {
    orchestrator: Arc<Orchestrator>,
    tick: Duration,
    state: Mutex<HashMap<i64, TaskHealth>>,
}

impl HealthChecker {
    pub fn new(orchestrator: Arc<Orchestrator>, tick: Duration) -> Self {
        Self {
            orchestrator,
            tick: tick.max(Duration::from_millis(10)),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check_due(Instant::now()).await,
                }
            }
            debug!("Health checker stopped");
        })
    }

    /// Consecutive failures recorded for `target` of task `task_id`
    pub fn failures(&self, task_id: i64, target: &str) -> u32 {
        self.lock()
            .get(&task_id)
            .and_then(|h| h.failures.get(target).copied())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, TaskHealth>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probe every task whose next check is at or before `now`
    pub async fn check_due(&self, now: Instant) {
        let running: Vec<Arc<Tunnel>> = self
            .orchestrator
            .running_tasks()
            .into_iter()
            .map(|r| r.tunnel)
            .filter(|t| t.health.is_enabled())
            .collect();

        let due: Vec<Arc<Tunnel>> = {
            let mut state = self.lock();
            state.retain(|id, h| {
                running
                    .iter()
                    .any(|t| t.id == *id && Arc::ptr_eq(t, &h.tunnel))
            });
            let mut due = Vec::new();
            for task in running {
                let entry = state.entry(task.id).or_insert_with(|| TaskHealth {
                    tunnel: Arc::clone(&task),
                    next_check: now,
                    failures: HashMap::new(),
                });
                if entry.next_check <= now {
                    due.push(task);
                }
            }
            due
        };

        let mut rounds = JoinSet::new();
        for task in due {
            rounds.spawn(async move {
                let results = probe_all(&task).await;
                (task, results)
            });
        }
        while let Some(joined) = rounds.join_next().await {
            let (task, results) = match joined {
                Ok(round) => round,
                Err(e) => {
                    warn!("Health check round panicked: {}", e);
                    continue;
                }
            };
            let mut state = self.lock();
            let Some(entry) = state.get_mut(&task.id) else {
                continue;
            };
            for (target, result) in results {
                apply(&task, &mut entry.failures, target, result);
            }
            entry.next_check = now + Duration::from_secs(task.health.check_interval);
        }
    }
}

fn apply(task: &Tunnel, failures: &mut HashMap<String, u32>, target: String, result: Result<(), ProbeError>) {
    match result {
        Ok(()) => {
            failures.remove(&target);
            if task.target.mark_up(&target) {
                info!(task_id = task.id, %target, "Target recovered, back in rotation");
            }
        }
        Err(e) => {
            let count = failures.entry(target.clone()).or_insert(0);
            *count += 1;
            debug!(task_id = task.id, %target, failures = *count, "Health probe failed: {}", e);
            if *count >= task.health.max_fail && task.target.mark_down(&target) {
                warn!(task_id = task.id, %target, "Target marked down after {} failures", count);
            }
        }
    }
}

async fn probe_all(task: &Tunnel) -> Vec<(String, Result<(), ProbeError>)> {
    let mut probes = JoinSet::new();
    for target in task.health.probe_targets(&task.target) {
        let health = task.health.clone();
        probes.spawn(async move {
            let result = probe(&target, &health).await;
            (target, result)
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(task_id = task.id, "Health probe panicked: {}", e),
        }
    }
    results
}

async fn probe(target: &str, health: &Health) -> Result<(), ProbeError> {
    let limit = Duration::from_secs(health.check_timeout.max(1));
    let attempt = async {
        match health.check_type {
            HealthCheckType::Tcp => TcpStream::connect(target)
                .await
                .map(drop)
                .map_err(ProbeError::from),
            HealthCheckType::Http => probe_http(target, &health.http_url).await,
        }
    };
    tokio::time::timeout(limit, attempt)
        .await
        .map_err(|_| ProbeError::Timeout)?
}

async fn probe_http(target: &str, url: &str) -> Result<(), ProbeError> {
    let stream = TcpStream::connect(target).await?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            trace!("Health probe connection closed: {}", e);
        }
    });

    let path = if url.starts_with('/') {
        url.to_string()
    } else {
        format!("/{}", url)
    };
    let request = Request::get(path)
        .header(header::HOST, target)
        .header(header::CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    if response.status() == StatusCode::OK {
        Ok(())
    } else {
        Err(ProbeError::Status(response.status()))
    }
}
