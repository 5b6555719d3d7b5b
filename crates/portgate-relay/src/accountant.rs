//! Batched traffic accounting and quota cache
//!
//! Relays report billed bytes here in O(1). A periodic flush writes the
//! accumulated bytes of each account back to storage as a negative KB delta,
//! either once they reach the flush threshold or once they alone exceed the
//! account's remaining quota. Quota checks on the hot path read the cached
//! limit minus pending bytes, so no storage call is made per write.

use dashmap::DashMap;
use portgate_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone)]
pub struct AccountantConfig {
    pub flush_interval: Duration,
    /// Pending bytes that force a flush regardless of quota
    pub flush_threshold: i64,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            flush_threshold: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrafficRecord {
    accumulated: i64,
    last_updated: Instant,
}

pub struct TrafficAccountant {
    store: Arc<dyn Store>,
    config: AccountantConfig,
    records: DashMap<i64, TrafficRecord>,
    /// Remaining quota per account in bytes, as last read from storage
    limits: DashMap<i64, i64>,
}

impl TrafficAccountant {
    pub fn new(store: Arc<dyn Store>, config: AccountantConfig) -> Self {
        Self {
            store,
            config,
            records: DashMap::new(),
            limits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    pub fn accumulate(&self, account_id: i64, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let now = Instant::now();
        self.records
            .entry(account_id)
            .and_modify(|r| {
                r.accumulated += bytes;
                r.last_updated = now;
            })
            .or_insert(TrafficRecord {
                accumulated: bytes,
                last_updated: now,
            });
    }

    /// Bytes reported but not yet flushed
    pub fn pending(&self, account_id: i64) -> i64 {
        self.records
            .get(&account_id)
            .map(|r| r.accumulated)
            .unwrap_or(0)
    }

    pub fn pending_accounts(&self) -> usize {
        self.records.len()
    }

    /// Cached remaining quota, loaded from storage on first use
    ///
    /// A storage error counts as no quota left.
    pub async fn cached_limit(&self, account_id: i64) -> i64 {
        if let Some(limit) = self.limits.get(&account_id) {
            return *limit;
        }
        let limit = match self.store.account_flow_limit(account_id).await {
            Ok(limit) => limit,
            Err(e) => {
                warn!(account_id, "Failed to load flow limit: {}", e);
                0
            }
        };
        *self.limits.entry(account_id).or_insert(limit)
    }

    /// Quota left once pending bytes are charged; zero or less means exhausted
    pub async fn remaining(&self, account_id: i64) -> i64 {
        self.cached_limit(account_id).await - self.pending(account_id)
    }

    async fn refresh_limit(&self, account_id: i64) {
        match self.store.account_flow_limit(account_id).await {
            Ok(limit) => {
                self.limits.insert(account_id, limit);
            }
            Err(e) => warn!(account_id, "Failed to refresh flow limit: {}", e),
        }
    }

    /// Flush every account whose pending bytes crossed the threshold or its quota
    pub async fn conditional_flush(&self) {
        let snapshot: Vec<(i64, i64)> = self
            .records
            .iter()
            .map(|r| (*r.key(), r.accumulated))
            .collect();

        for (account_id, accumulated) in snapshot {
            self.refresh_limit(account_id).await;
            let limit = self.limits.get(&account_id).map(|l| *l).unwrap_or(0);

            if accumulated < self.config.flush_threshold && accumulated < limit {
                trace!(account_id, accumulated, limit, "Traffic below flush threshold");
                continue;
            }

            self.flush_account(account_id, accumulated).await;
        }
    }

    /// Charge `accumulated` bytes to storage and settle them out of the pending record
    async fn flush_account(&self, account_id: i64, accumulated: i64) {
        let kb = accumulated as f64 / 1024.0;
        if let Err(e) = self.store.add_traffic(account_id, -kb).await {
            error!(account_id, "Failed to flush traffic: {}", e);
            return;
        }
        debug!(account_id, bytes = accumulated, "Flushed traffic");

        // Pending bytes and the cached limit move together, once the new limit is known
        let fresh = self.store.account_flow_limit(account_id).await;
        if let Some(mut record) = self.records.get_mut(&account_id) {
            record.accumulated -= accumulated;
            match fresh {
                Ok(limit) => {
                    self.limits.insert(account_id, limit);
                }
                Err(e) => {
                    warn!(account_id, "Failed to refresh flow limit: {}", e);
                    self.limits.remove(&account_id);
                }
            }
        }
        self.records.remove_if(&account_id, |_, r| r.accumulated <= 0);
    }

    /// Forget pending bytes and cached quota of a deleted account
    pub fn forget_account(&self, account_id: i64) {
        self.records.remove(&account_id);
        self.limits.remove(&account_id);
    }

    /// Run `conditional_flush` every `flush_interval` until cancelled
    ///
    /// Pending bytes are flushed one last time on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let accountant = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(accountant.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => accountant.conditional_flush().await,
                }
            }
            accountant.flush_all().await;
            debug!("Traffic flusher stopped");
        })
    }

    /// Flush everything pending regardless of thresholds
    pub async fn flush_all(&self) {
        let snapshot: Vec<(i64, i64)> = self
            .records
            .iter()
            .map(|r| (*r.key(), r.accumulated))
            .collect();
        for (account_id, accumulated) in snapshot {
            self.flush_account(account_id, accumulated).await;
        }
    }
}
