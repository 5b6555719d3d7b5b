//! In-memory [`Store`] implementation
//!
//! All data is lost when the broker restarts unless it is re-seeded.

use crate::seed::{Account, Seed};
use crate::{Store, StoreError};
use dashmap::DashMap;
use portgate_proto::{password_digest, Client, Host, Tunnel};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

const KB: f64 = 1024.0;

pub struct MemoryStore {
    tasks: DashMap<i64, Tunnel>,
    clients: DashMap<i64, Client>,
    hosts: DashMap<i64, Host>,
    accounts: DashMap<i64, Account>,
    next_task_id: AtomicI64,
    next_client_id: AtomicI64,
    next_host_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            clients: DashMap::new(),
            hosts: DashMap::new(),
            accounts: DashMap::new(),
            next_task_id: AtomicI64::new(1),
            next_client_id: AtomicI64::new(1),
            next_host_id: AtomicI64::new(1),
        }
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for client in seed.clients {
            bump(&store.next_client_id, client.id);
            store.clients.insert(client.id, client);
        }
        for task in seed.tasks {
            bump(&store.next_task_id, task.id);
            store.tasks.insert(task.id, detach(task));
        }
        for host in seed.hosts {
            bump(&store.next_host_id, host.id);
            store.hosts.insert(host.id, host);
        }
        for account in seed.accounts {
            store.accounts.insert(account.id, account);
        }
        debug!(
            clients = store.clients.len(),
            tasks = store.tasks.len(),
            hosts = store.hosts.len(),
            "Memory store seeded"
        );
        store
    }

    pub fn put_account(&self, account: Account) {
        self.accounts.insert(account.id, account);
    }

    /// Remaining quota of an account in KB
    pub fn account_flow_kb(&self, account_id: i64) -> Option<f64> {
        self.accounts.get(&account_id).map(|a| a.flow_kb)
    }

    fn password_taken(&self, task: &Tunnel) -> bool {
        task.mode.is_portless()
            && !task.password.is_empty()
            && self.tasks.iter().any(|t| {
                t.id != task.id && t.mode.is_portless() && t.password == task.password
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicI64, seen: i64) {
    counter.fetch_max(seen + 1, Ordering::Relaxed);
}

/// Strip live decorations before a record is stored
fn detach(mut task: Tunnel) -> Tunnel {
    task.run_status = false;
    task.client = None;
    task
}

fn sorted_by_id<T, F: Fn(&T) -> i64>(mut items: Vec<T>, key: F) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_task(&self, id: i64) -> Result<Tunnel, StoreError> {
        self.tasks
            .get(&id)
            .map(|t| t.clone())
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn all_tasks(&self) -> Result<Vec<Tunnel>, StoreError> {
        let tasks = self.tasks.iter().map(|t| t.clone()).collect();
        Ok(sorted_by_id(tasks, |t: &Tunnel| t.id))
    }

    async fn tasks_by_client(&self, client_id: i64) -> Result<Vec<Tunnel>, StoreError> {
        let tasks = self
            .tasks
            .iter()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.clone())
            .collect();
        Ok(sorted_by_id(tasks, |t: &Tunnel| t.id))
    }

    async fn user_tasks(
        &self,
        account_id: i64,
        client_id: Option<i64>,
    ) -> Result<Vec<Tunnel>, StoreError> {
        let tasks = self
            .tasks
            .iter()
            .filter(|t| t.account_id == account_id)
            .filter(|t| client_id.map_or(true, |c| t.client_id == c))
            .map(|t| t.clone())
            .collect();
        Ok(sorted_by_id(tasks, |t: &Tunnel| t.id))
    }

    async fn new_task(&self, mut task: Tunnel) -> Result<i64, StoreError> {
        if self.password_taken(&task) {
            return Err(StoreError::DuplicatePassword);
        }
        if task.id == 0 {
            task.id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        } else {
            bump(&self.next_task_id, task.id);
        }
        let id = task.id;
        self.tasks.insert(id, detach(task));
        Ok(id)
    }

    async fn update_task(&self, task: &Tunnel) -> Result<(), StoreError> {
        if self.password_taken(task) {
            return Err(StoreError::DuplicatePassword);
        }
        let mut entry = self
            .tasks
            .get_mut(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        *entry = detach(task.clone());
        Ok(())
    }

    async fn del_task(&self, id: i64) -> Result<(), StoreError> {
        self.tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn task_by_password_md5(&self, digest: &str) -> Result<Option<Tunnel>, StoreError> {
        Ok(self
            .tasks
            .iter()
            .find(|t| !t.password.is_empty() && password_digest(&t.password) == digest)
            .map(|t| t.clone()))
    }

    async fn get_client(&self, id: i64) -> Result<Client, StoreError> {
        self.clients
            .get(&id)
            .map(|c| c.clone())
            .ok_or(StoreError::ClientNotFound(id))
    }

    async fn all_clients(&self) -> Result<Vec<Client>, StoreError> {
        let clients = self.clients.iter().map(|c| c.clone()).collect();
        Ok(sorted_by_id(clients, |c: &Client| c.id))
    }

    async fn new_client(&self, mut client: Client) -> Result<i64, StoreError> {
        if client.id == 0 {
            client.id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        } else {
            bump(&self.next_client_id, client.id);
        }
        let id = client.id;
        self.clients.insert(id, client);
        Ok(id)
    }

    async fn update_client(&self, client: &Client) -> Result<(), StoreError> {
        let mut entry = self
            .clients
            .get_mut(&client.id)
            .ok_or(StoreError::ClientNotFound(client.id))?;
        *entry = client.clone();
        Ok(())
    }

    async fn del_client(&self, id: i64) -> Result<(), StoreError> {
        self.clients
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::ClientNotFound(id))
    }

    async fn all_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let hosts = self.hosts.iter().map(|h| h.clone()).collect();
        Ok(sorted_by_id(hosts, |h: &Host| h.id))
    }

    async fn hosts_by_client(&self, client_id: i64) -> Result<Vec<Host>, StoreError> {
        let hosts = self
            .hosts
            .iter()
            .filter(|h| h.client_id == client_id)
            .map(|h| h.clone())
            .collect();
        Ok(sorted_by_id(hosts, |h: &Host| h.id))
    }

    async fn new_host(&self, mut host: Host) -> Result<i64, StoreError> {
        if host.id == 0 {
            host.id = self.next_host_id.fetch_add(1, Ordering::Relaxed);
        } else {
            bump(&self.next_host_id, host.id);
        }
        let id = host.id;
        self.hosts.insert(id, host);
        Ok(id)
    }

    async fn del_host(&self, id: i64) -> Result<(), StoreError> {
        self.hosts
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::HostNotFound(id))
    }

    async fn account_flow_limit(&self, account_id: i64) -> Result<i64, StoreError> {
        self.accounts
            .get(&account_id)
            .map(|a| (a.flow_kb.max(0.0) * KB) as i64)
            .ok_or(StoreError::AccountNotFound(account_id))
    }

    async fn add_traffic(&self, account_id: i64, delta_kb: f64) -> Result<(), StoreError> {
        let mut account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound(account_id))?;
        account.flow_kb = (account.flow_kb.max(0.0) + delta_kb).max(0.0);
        Ok(())
    }
}
