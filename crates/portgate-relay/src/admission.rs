//! Per-client runtime state: live connection count and the shared rate limiter
//!
//! Client records are re-read from storage on every accept, so the values that
//! must survive across connections (the `NowConn` counter and the token bucket)
//! live here, keyed by client id.

use crate::limiter::RateLimiter;
use crate::RelayError;
use dashmap::DashMap;
use portgate_proto::Client;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ClientRuntime {
    now_conn: AtomicU32,
    limiter: Mutex<Option<Arc<RateLimiter>>>,
}

impl ClientRuntime {
    /// Compare-and-increment bounded by `max` (0 is unlimited)
    fn try_acquire(&self, max: u32) -> bool {
        self.now_conn
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                if max == 0 || now < max {
                    Some(now + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Connection slot of a client; released on drop
#[derive(Debug)]
pub struct ConnGuard {
    runtime: Arc<ClientRuntime>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.runtime.now_conn.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of admitting a public connection
#[derive(Debug)]
pub struct Admission {
    pub guard: ConnGuard,
    pub limiter: Option<Arc<RateLimiter>>,
}

#[derive(Debug, Default)]
pub struct ClientRuntimes {
    clients: DashMap<i64, Arc<ClientRuntime>>,
}

impl ClientRuntimes {
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime(&self, client_id: i64) -> Arc<ClientRuntime> {
        Arc::clone(self.clients.entry(client_id).or_default().value())
    }

    /// Black IP list, then connection ceiling, then rate limiter lookup
    pub fn admit(&self, client: &Client, peer: Option<SocketAddr>) -> Result<Admission, RelayError> {
        if let Some(peer) = peer {
            if client.black_ip_list.contains_peer(&peer) {
                warn!(client_id = client.id, peer = %peer, "Rejected connection from black-listed address");
                return Err(RelayError::Blocked(peer.ip()));
            }
        }

        let runtime = self.runtime(client.id);
        if !runtime.try_acquire(client.max_conn) {
            debug!(client_id = client.id, max_conn = client.max_conn, "Connection limit reached");
            return Err(RelayError::ConnectionLimit {
                client_id: client.id,
                max: client.max_conn,
            });
        }
        let guard = ConnGuard {
            runtime: Arc::clone(&runtime),
        };

        Ok(Admission {
            guard,
            limiter: self.limiter_for(&runtime, client.rate_limit),
        })
    }

    /// The client's token bucket, created on first use and replaced when the rate changes
    fn limiter_for(&self, runtime: &ClientRuntime, rate_kb: u32) -> Option<Arc<RateLimiter>> {
        let mut slot = runtime.limiter.lock().unwrap_or_else(PoisonError::into_inner);
        if rate_kb == 0 {
            *slot = None;
            return None;
        }
        let wanted = u64::from(rate_kb) * 1024;
        match slot.as_ref() {
            Some(limiter) if limiter.rate() == wanted => Some(Arc::clone(limiter)),
            _ => {
                let limiter = Arc::new(RateLimiter::new(wanted));
                *slot = Some(Arc::clone(&limiter));
                Some(limiter)
            }
        }
    }

    pub fn now_conn(&self, client_id: i64) -> u32 {
        self.clients
            .get(&client_id)
            .map(|r| r.now_conn.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn total_now_conn(&self) -> u64 {
        self.clients
            .iter()
            .map(|r| u64::from(r.now_conn.load(Ordering::Acquire)))
            .sum()
    }

    /// Drop the runtime of a deleted client; live guards keep their own reference
    pub fn forget(&self, client_id: i64) {
        self.clients.remove(&client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portgate_proto::IpList;

    fn client(max_conn: u32, rate_limit: u32) -> Client {
        let mut client = Client::new(1, "k");
        client.max_conn = max_conn;
        client.rate_limit = rate_limit;
        client
    }

    #[test]
    fn test_connection_ceiling() {
        let runtimes = ClientRuntimes::new();
        let c = client(2, 0);
        let a = runtimes.admit(&c, None).unwrap();
        let _b = runtimes.admit(&c, None).unwrap();
        assert!(matches!(
            runtimes.admit(&c, None),
            Err(RelayError::ConnectionLimit { client_id: 1, max: 2 })
        ));
        assert_eq!(runtimes.now_conn(1), 2);

        drop(a);
        assert_eq!(runtimes.now_conn(1), 1);
        assert!(runtimes.admit(&c, None).is_ok());
    }

    #[test]
    fn test_unlimited_connections() {
        let runtimes = ClientRuntimes::new();
        let c = client(0, 0);
        let guards: Vec<_> = (0..100).map(|_| runtimes.admit(&c, None).unwrap()).collect();
        assert_eq!(runtimes.total_now_conn(), 100);
        drop(guards);
        assert_eq!(runtimes.total_now_conn(), 0);
    }

    #[test]
    fn test_black_list_checked_first() {
        let runtimes = ClientRuntimes::new();
        let mut c = client(1, 0);
        c.black_ip_list = IpList::parse(["192.0.2.0/24"]).unwrap();
        let peer: SocketAddr = "192.0.2.10:5555".parse().unwrap();
        assert!(matches!(
            runtimes.admit(&c, Some(peer)),
            Err(RelayError::Blocked(_))
        ));
        assert_eq!(runtimes.now_conn(1), 0);

        let ok: SocketAddr = "198.51.100.1:5555".parse().unwrap();
        assert!(runtimes.admit(&c, Some(ok)).is_ok());
    }

    #[test]
    fn test_limiter_shared_and_recreated_on_rate_change() {
        let runtimes = ClientRuntimes::new();
        let a = runtimes.admit(&client(0, 64), None).unwrap();
        let b = runtimes.admit(&client(0, 64), None).unwrap();
        let la = a.limiter.unwrap();
        assert!(Arc::ptr_eq(&la, b.limiter.as_ref().unwrap()));
        assert_eq!(la.rate(), 64 * 1024);

        let c = runtimes.admit(&client(0, 128), None).unwrap();
        assert_eq!(c.limiter.as_ref().unwrap().rate(), 128 * 1024);
        assert!(!Arc::ptr_eq(&la, c.limiter.as_ref().unwrap()));

        assert!(runtimes.admit(&client(0, 0), None).unwrap().limiter.is_none());
    }
}
