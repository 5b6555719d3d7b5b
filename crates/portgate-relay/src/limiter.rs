//! Token bucket rate limiter
//!
//! Shared by every relay of one client. Tokens are refilled lazily on each
//! `consume` call; a caller that overdraws the bucket sleeps until its debt is
//! paid back, which keeps long-run throughput at the configured rate without a
//! background refill task.

use std::sync::{Mutex, PoisonError};
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    /// May go negative while callers are paying back a large read
    available: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `rate` is in bytes per second and must be non-zero
    pub fn new(rate: u64) -> Self {
        let rate = rate.max(1);
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                available: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_kb_per_sec(kb: u32) -> Self {
        Self::new(u64::from(kb) * 1024)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Take `bytes` tokens, sleeping while the bucket is in debt
    pub async fn consume(&self, bytes: usize) {
        let wait = {
            let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            let capacity = self.rate as f64;
            bucket.available = (bucket.available + elapsed * capacity).min(capacity);
            bucket.last_refill = now;
            bucket.available -= bytes as f64;
            if bucket.available >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-bucket.available / capacity))
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}
