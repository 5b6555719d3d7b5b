//! Backend target selection
//!
//! A [`Target`] holds the newline separated backend list of a task and hands
//! addresses out in strict round-robin order. Targets reported unhealthy are
//! skipped until they are marked up again.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("no backend targets available")]
    NoTargetsAvailable,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Target {
    /// Backend addresses, one per line
    #[serde(default)]
    pub target_str: String,

    /// Dial the backend from the broker instead of through the client
    #[serde(default)]
    pub local_proxy: bool,

    #[serde(skip)]
    parsed: OnceLock<Vec<String>>,

    #[serde(skip)]
    cursor: Mutex<usize>,

    #[serde(skip)]
    down: RwLock<HashSet<String>>,

    #[serde(skip)]
    down_count: AtomicUsize,
}

impl Target {
    pub fn new(target_str: impl Into<String>) -> Self {
        Self {
            target_str: target_str.into(),
            ..Default::default()
        }
    }

    pub fn local(target_str: impl Into<String>) -> Self {
        Self {
            local_proxy: true,
            ..Self::new(target_str)
        }
    }

    /// Parsed backend list, split on first use
    pub fn addresses(&self) -> &[String] {
        self.parsed.get_or_init(|| {
            self.target_str
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Next backend address in round-robin order
    ///
    /// A single-address list is returned without touching the cursor.
    pub fn select(&self) -> Result<String, TargetError> {
        let addrs = self.addresses();
        if addrs.len() == 1 && self.down_count.load(Ordering::Acquire) == 0 {
            return Ok(addrs[0].clone());
        }
        if addrs.is_empty() {
            return Err(TargetError::NoTargetsAvailable);
        }

        let down = self.down.read().unwrap_or_else(PoisonError::into_inner);
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let len = addrs.len();
        for step in 0..len {
            let idx = (*cursor + step) % len;
            if !down.contains(&addrs[idx]) {
                *cursor = (idx + 1) % len;
                return Ok(addrs[idx].clone());
            }
        }
        Err(TargetError::NoTargetsAvailable)
    }

    /// Take an address out of rotation; returns false if it was already down
    pub fn mark_down(&self, addr: &str) -> bool {
        let mut down = self.down.write().unwrap_or_else(PoisonError::into_inner);
        let inserted = down.insert(addr.to_string());
        self.down_count.store(down.len(), Ordering::Release);
        inserted
    }

    /// Put an address back into rotation; returns false if it was not down
    pub fn mark_up(&self, addr: &str) -> bool {
        let mut down = self.down.write().unwrap_or_else(PoisonError::into_inner);
        let removed = down.remove(addr);
        self.down_count.store(down.len(), Ordering::Release);
        removed
    }

    pub fn is_down(&self, addr: &str) -> bool {
        self.down_count.load(Ordering::Acquire) > 0
            && self
                .down
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(addr)
    }
}

/// Clones carry the configuration only; selection and health state start fresh
impl Clone for Target {
    fn clone(&self) -> Self {
        Self {
            target_str: self.target_str.clone(),
            local_proxy: self.local_proxy,
            ..Default::default()
        }
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.target_str == other.target_str && self.local_proxy == other.local_proxy
    }
}
