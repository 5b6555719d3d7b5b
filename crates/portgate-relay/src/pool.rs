//! Bounded worker pools
//!
//! A pool is a semaphore with a fixed number of permits. Submitting work waits
//! for a permit, so a saturated pool pushes back on whoever submits (the accept
//! loop for relay pairs, the pair task for copy jobs) instead of growing.

use crate::RelayError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::trace;

/// Slot held for the lifetime of one unit of work
#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a slot is free
    pub async fn acquire(&self) -> Result<PoolSlot, RelayError> {
        if self.semaphore.available_permits() == 0 {
            trace!(pool = self.name, "Worker pool saturated, waiting for a slot");
        }
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RelayError::PoolClosed(self.name))?;
        Ok(PoolSlot { _permit: permit })
    }

    /// Run `job` on the pool once a slot is free; the slot is held until it finishes
    pub async fn spawn<F>(&self, job: F) -> Result<JoinHandle<F::Output>, RelayError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = self.acquire().await?;
        Ok(tokio::spawn(async move {
            let output = job.await;
            drop(slot);
            output
        }))
    }

    /// Stop handing out slots; pending and future submissions fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_holds_slot_until_done() {
        let pool = WorkerPool::new("test", 1);
        let (tx, rx) = oneshot::channel::<()>();

        let first = pool.spawn(async move { rx.await.is_ok() }).await.unwrap();
        assert_eq!(pool.in_use(), 1);

        // Saturated: the second submission waits
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        tx.send(()).unwrap();
        assert!(first.await.unwrap());

        let slot = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        drop(slot);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::new("closed", 2);
        pool.close();
        assert!(matches!(
            pool.acquire().await,
            Err(RelayError::PoolClosed("closed"))
        ));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(WorkerPool::new("z", 0).capacity(), 1);
    }
}
