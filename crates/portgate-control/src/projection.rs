//! Read-only views over persisted records, decorated with live state

use crate::orchestrator::Orchestrator;
use crate::ControlError;
use portgate_proto::{Client, Mode, Tunnel};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Id,
    ClientId,
    Remark,
    VerifyKey,
    Target,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filters and pagination for task listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelQuery {
    pub offset: usize,
    /// 0 returns everything after `offset`
    pub limit: usize,
    pub mode: Option<Mode>,
    pub client_id: Option<i64>,
    /// Case-insensitive match on id, remark, port, target or client key
    pub search: String,
    pub sort: SortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelPage {
    pub rows: Vec<Tunnel>,
    /// Matching tasks before pagination
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientQuery {
    pub offset: usize,
    pub limit: usize,
    /// Case-insensitive match on id, verify key or remark
    pub search: String,
    pub client_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientPage {
    pub rows: Vec<Client>,
    pub total: usize,
}

/// Aggregate counters for the admin overview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub client_count: usize,
    pub client_online_count: usize,
    pub host_count: usize,
    pub tcp_count: usize,
    pub udp_count: usize,
    pub socks5_count: usize,
    pub http_proxy_count: usize,
    pub secret_count: usize,
    pub p2p_count: usize,
    pub inlet_flow_count: i64,
    pub export_flow_count: i64,
    pub now_conn: u64,
    pub running_count: usize,
}

fn paginate<T>(rows: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let rows = rows.into_iter().skip(offset);
    if limit == 0 {
        rows.collect()
    } else {
        rows.take(limit).collect()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn compare(a: &Tunnel, b: &Tunnel, field: SortField) -> Ordering {
    let key = |t: &Tunnel| {
        t.client
            .as_ref()
            .map(|c| c.verify_key.clone())
            .unwrap_or_default()
    };
    match field {
        SortField::Id => a.id.cmp(&b.id),
        SortField::ClientId => a.client_id.cmp(&b.client_id),
        SortField::Remark => a.remark.cmp(&b.remark),
        SortField::VerifyKey => key(a).cmp(&key(b)),
        SortField::Target => a.target.target_str.cmp(&b.target.target_str),
    }
}

impl Orchestrator {
    /// Attach registry membership, live counters and the owning client
    fn decorate(&self, task: &mut Tunnel, clients: &HashMap<i64, Client>) {
        if let Some(running) = self.running_task(task.id) {
            task.run_status = true;
            task.flow = running.tunnel.flow.clone();
            task.is_http = running.tunnel.is_http.clone();
        } else {
            task.run_status = false;
        }
        task.client = clients.get(&task.client_id).map(|c| self.decorate_client(c.clone()));
    }

    fn decorate_client(&self, mut client: Client) -> Client {
        let bridge = self.bridge();
        client.is_connect = bridge.is_connected(client.id);
        client.version = bridge.client_version(client.id).unwrap_or_default();
        client.now_conn = self.context().clients.now_conn(client.id);
        client
    }

    async fn client_index(&self) -> Result<HashMap<i64, Client>, ControlError> {
        Ok(self
            .store()
            .all_clients()
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }

    fn project(&self, tasks: Vec<Tunnel>, clients: &HashMap<i64, Client>, query: &TunnelQuery) -> TunnelPage {
        let search = query.search.trim().to_lowercase();
        let mut rows: Vec<Tunnel> = tasks
            .into_iter()
            .filter(|t| query.mode.is_none_or(|m| t.mode == m))
            .filter(|t| query.client_id.is_none_or(|id| t.client_id == id))
            .map(|mut t| {
                self.decorate(&mut t, clients);
                t
            })
            .filter(|t| {
                search.is_empty()
                    || t.id.to_string() == search
                    || t.port.to_string() == search
                    || contains_ci(&t.remark, &search)
                    || contains_ci(&t.target.target_str, &search)
                    || t.client
                        .as_ref()
                        .is_some_and(|c| contains_ci(&c.verify_key, &search))
            })
            .collect();

        // sort_by is stable, ties keep store order
        rows.sort_by(|a, b| {
            let ord = compare(a, b, query.sort);
            match query.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = rows.len();
        TunnelPage {
            rows: paginate(rows, query.offset, query.limit),
            total,
        }
    }

    /// Every persisted task matching `query`
    pub async fn get_tunnel(&self, query: &TunnelQuery) -> Result<TunnelPage, ControlError> {
        let clients = self.client_index().await?;
        let tasks = self.store().all_tasks().await?;
        Ok(self.project(tasks, &clients, query))
    }

    /// Tasks billed to one account, optionally narrowed to one client
    pub async fn get_tunnel_v2(
        &self,
        account_id: i64,
        client_id: Option<i64>,
        query: &TunnelQuery,
    ) -> Result<TunnelPage, ControlError> {
        let clients = self.client_index().await?;
        let tasks = self.store().user_tasks(account_id, client_id).await?;
        Ok(self.project(tasks, &clients, query))
    }

    /// Displayable clients with connection state and bridge-reported version
    pub async fn get_client_list(&self, query: &ClientQuery) -> Result<ClientPage, ControlError> {
        let search = query.search.trim().to_lowercase();
        let mut rows: Vec<Client> = self
            .store()
            .all_clients()
            .await?
            .into_iter()
            .filter(|c| !c.no_display)
            .filter(|c| query.client_id.is_none_or(|id| c.id == id))
            .filter(|c| {
                search.is_empty()
                    || c.id.to_string() == search
                    || contains_ci(&c.verify_key, &search)
                    || contains_ci(&c.remark, &search)
            })
            .map(|c| self.decorate_client(c))
            .collect();
        rows.sort_by_key(|c| c.id);

        let total = rows.len();
        Ok(ClientPage {
            rows: paginate(rows, query.offset, query.limit),
            total,
        })
    }

    pub async fn dashboard(&self) -> Result<Dashboard, ControlError> {
        let clients = self.store().all_clients().await?;
        let hosts = self.store().all_hosts().await?;
        let tasks = self.store().all_tasks().await?;

        let mut dash = Dashboard {
            client_count: clients.len(),
            client_online_count: clients
                .iter()
                .filter(|c| self.bridge().is_connected(c.id))
                .count(),
            host_count: hosts.len(),
            now_conn: self.context().clients.total_now_conn(),
            running_count: self.running_count(),
            ..Default::default()
        };
        for client in &clients {
            dash.inlet_flow_count += client.flow.inlet();
            dash.export_flow_count += client.flow.export();
        }
        for running in self.running_tasks() {
            dash.inlet_flow_count += running.tunnel.flow.inlet();
            dash.export_flow_count += running.tunnel.flow.export();
        }
        for task in &tasks {
            match task.mode {
                Mode::Tcp => dash.tcp_count += 1,
                Mode::Udp => dash.udp_count += 1,
                Mode::Socks5 => dash.socks5_count += 1,
                Mode::HttpProxy => dash.http_proxy_count += 1,
                Mode::Secret => dash.secret_count += 1,
                Mode::P2p => dash.p2p_count += 1,
                _ => {}
            }
        }
        Ok(dash)
    }
}
