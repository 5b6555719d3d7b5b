//! Virtual host route table for the shared HTTP/HTTPS listener

use dashmap::DashMap;
use portgate_proto::{Host, Mode, Tunnel};
use portgate_store::Store;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a request for a host name goes
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Task the connection is relayed under; carries target and rewrite rules
    pub task: Arc<Tunnel>,
    /// Id of the `Host` record the route came from, if any
    pub host_id: Option<i64>,
}

/// Host name routes from running `https` tasks and persisted `Host` records
pub struct HostRoutes {
    store: Arc<dyn Store>,
    tasks: DashMap<String, Arc<Tunnel>>,
    /// Tasks synthesized from `Host` records, kept so target cursors persist
    synthesized: DashMap<i64, Arc<Tunnel>>,
}

fn normalize(host: &str) -> String {
    let host = host.trim();
    // Strip a port but keep bracketed IPv6 literals intact
    let host = match host.rfind(':') {
        Some(i) if !host[i..].contains(']') && host[..i].rfind(':').is_none() => &host[..i],
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Exact names beat `*.suffix` wildcards
fn host_score(pattern: &str, host: &str) -> Option<u8> {
    let pattern = normalize(pattern);
    if pattern == host {
        return Some(2);
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) if host.len() > suffix.len() && host.ends_with(&format!(".{}", suffix)) => {
            Some(1)
        }
        _ => None,
    }
}

impl HostRoutes {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            tasks: DashMap::new(),
            synthesized: DashMap::new(),
        }
    }

    /// Serve `task.host` from a running `https` task
    pub fn register_task(&self, task: Arc<Tunnel>) -> bool {
        let host = normalize(&task.host);
        if host.is_empty() {
            warn!(task_id = task.id, "https task has no host name, not routed");
            return false;
        }
        debug!(task_id = task.id, %host, "Registered host route");
        self.tasks.insert(host, task);
        true
    }

    /// Drop the route of task `task_id`, if it still owns one
    pub fn unregister_task(&self, task_id: i64) {
        self.tasks.retain(|_, task| task.id != task_id);
    }

    /// Forget the cached task of a `Host` record after it changed or was deleted
    pub fn forget_host(&self, host_id: i64) {
        self.synthesized.remove(&host_id);
    }

    pub fn task_routes(&self) -> usize {
        self.tasks.len()
    }

    /// Route `host` (a `Host` header or SNI name) for a request to `path`
    pub async fn resolve(&self, host: &str, path: &str, scheme: &str) -> Option<RouteMatch> {
        let host = normalize(host);
        if host.is_empty() {
            return None;
        }
        if let Some(task) = self.tasks.get(&host) {
            return Some(RouteMatch {
                task: Arc::clone(&task),
                host_id: None,
            });
        }

        let hosts = match self.store.all_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Failed to load host records: {}", e);
                return None;
            }
        };
        let best = hosts
            .into_iter()
            .filter(|h| !h.is_close && h.serves_scheme(scheme) && h.location_matches(path))
            .filter_map(|h| host_score(&h.host, &host).map(|score| (score, h)))
            .max_by_key(|(score, h)| (*score, h.location.trim_end_matches('/').len()))
            .map(|(_, h)| h)?;

        let task = self.synthesize(best).await;
        Some(RouteMatch {
            host_id: Some(task.id),
            task,
        })
    }

    async fn synthesize(&self, host: Host) -> Arc<Tunnel> {
        if let Some(task) = self.synthesized.get(&host.id) {
            if task.target == host.target && task.host_change == host.host_change {
                return Arc::clone(&task);
            }
        }
        // Host traffic is billed to the owning client's account
        let account_id = match self.store.get_client(host.client_id).await {
            Ok(client) => client.account_id,
            Err(_) => 0,
        };
        let mut task = Tunnel::new(host.id, host.client_id, Mode::HttpHostServer);
        task.account_id = account_id;
        task.host = host.host;
        task.header_change = host.header_change;
        task.host_change = host.host_change;
        task.location = host.location;
        task.scheme = host.scheme;
        task.remark = host.remark;
        task.no_store = host.no_store;
        task.target = host.target;
        let task = Arc::new(task);
        self.synthesized.insert(host.id, Arc::clone(&task));
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portgate_proto::{Client, Target};
    use portgate_store::MemoryStore;

    fn host(id: i64, name: &str, location: &str, target: &str) -> Host {
        Host {
            id,
            client_id: 1,
            host: name.to_string(),
            location: location.to_string(),
            target: Target::new(target),
            ..Default::default()
        }
    }

    async fn routes(hosts: Vec<Host>) -> HostRoutes {
        let store = Arc::new(MemoryStore::new());
        let mut client = Client::new(1, "vkey");
        client.account_id = 9;
        store.new_client(client).await.unwrap();
        for h in hosts {
            store.new_host(h).await.unwrap();
        }
        HostRoutes::new(store)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Example.COM:8080"), "example.com");
        assert_eq!(normalize("example.com."), "example.com");
        assert_eq!(normalize("[::1]:443"), "[::1]");
        assert_eq!(normalize("::1"), "::1");
    }

    #[tokio::test]
    async fn test_https_task_routes_win() {
        let routes = routes(vec![host(1, "a.example.com", "", "10.0.0.1:80")]).await;
        let mut task = Tunnel::new(50, 1, Mode::Https);
        task.host = "a.example.com".into();
        task.target = Target::new("10.0.0.9:443");
        assert!(routes.register_task(Arc::new(task)));

        let hit = routes.resolve("a.example.com", "/", "https").await.unwrap();
        assert_eq!(hit.task.id, 50);
        assert_eq!(hit.host_id, None);

        routes.unregister_task(50);
        let hit = routes.resolve("a.example.com", "/", "https").await.unwrap();
        assert_eq!(hit.host_id, Some(1));
    }

    #[tokio::test]
    async fn test_longest_location_and_wildcard() {
        let routes = routes(vec![
            host(1, "*.example.com", "", "10.0.0.1:80"),
            host(2, "api.example.com", "/", "10.0.0.2:80"),
            host(3, "api.example.com", "/v2", "10.0.0.3:80"),
        ])
        .await;

        let hit = routes.resolve("api.example.com", "/v2/users", "http").await.unwrap();
        assert_eq!(hit.host_id, Some(3));
        assert_eq!(hit.task.account_id, 9);

        let hit = routes.resolve("API.example.com:80", "/v1", "http").await.unwrap();
        assert_eq!(hit.host_id, Some(2));

        let hit = routes.resolve("www.example.com", "/", "http").await.unwrap();
        assert_eq!(hit.host_id, Some(1));

        assert!(routes.resolve("example.com", "/", "http").await.is_none());
    }

    #[tokio::test]
    async fn test_synthesized_task_is_reused() {
        let routes = routes(vec![host(1, "a.test", "", "10.0.0.1:80\n10.0.0.2:80")]).await;
        let first = routes.resolve("a.test", "/", "http").await.unwrap();
        let second = routes.resolve("a.test", "/", "http").await.unwrap();
        assert!(Arc::ptr_eq(&first.task, &second.task));

        // Shared cursor: consecutive selections alternate
        assert_eq!(first.task.target.select().unwrap(), "10.0.0.1:80");
        assert_eq!(second.task.target.select().unwrap(), "10.0.0.2:80");
    }
}
