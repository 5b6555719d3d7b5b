//! Pooled copy buffers
//!
//! Copy jobs borrow a fixed-size buffer from a lock-free `ArrayQueue` and hand
//! it back on drop, so a busy relay does not allocate per read.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Copy buffer size used by relay jobs
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Idle buffers kept for reuse
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_POOL_CAPACITY, COPY_BUFFER_SIZE)
    }

    /// Take a buffer from the pool, allocating when it is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = match self.buffers.pop() {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    fn put(&self, buf: Vec<u8>) {
        // A full pool drops the buffer
        if buf.len() == self.buffer_size {
            let _ = self.buffers.push(buf);
        }
    }
}

/// Buffer checked out of a [`BufferPool`]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
