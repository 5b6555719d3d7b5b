//! Registry lifecycle, bridge event handling, projections and health checks

use portgate_bridge::{BoxedStream, Bridge, BridgeError, Link, LinkOpener, SecretSession, SessionBridge};
use portgate_control::{
    BridgeDispatcher, ClientQuery, ControlError, HealthChecker, Orchestrator, SortField, SortOrder,
    TunnelQuery, WebServerFactory,
};
use portgate_proto::{password_digest, Client, Health, HealthCheckType, Host, Mode, Target, Tunnel};
use portgate_relay::{AccountantConfig, ClientRuntimes, RelayConfig, RelayEngine, TrafficAccountant};
use portgate_server::{HostRoutes, PortPolicy, ServerContext, ServerError, ServerSettings, Service};
use portgate_store::{MemoryStore, Store};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Client transport that dials link targets directly
struct TcpOpener;

#[async_trait::async_trait]
impl LinkOpener for TcpOpener {
    async fn open(&self, link: &Link) -> Result<BoxedStream, BridgeError> {
        Ok(Box::new(TcpStream::connect(&link.target).await?))
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryStore>,
    bridge: Arc<SessionBridge>,
    events: Option<mpsc::Receiver<portgate_bridge::BridgeEvent>>,
}

impl Harness {
    fn new(ports: PortPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (bridge, events) = SessionBridge::new(16);
        let accountant = Arc::new(TrafficAccountant::new(store.clone(), AccountantConfig::default()));
        let ctx = ServerContext {
            store: store.clone(),
            bridge: bridge.clone(),
            engine: Arc::new(RelayEngine::new(RelayConfig::default(), accountant)),
            clients: Arc::new(ClientRuntimes::new()),
            routes: Arc::new(HostRoutes::new(store.clone())),
            settings: ServerSettings {
                http_proxy_port: Some(0),
                https_proxy_port: Some(0),
                host_bind_ip: "127.0.0.1".into(),
                ..Default::default()
            },
        };
        Self {
            orchestrator: Arc::new(Orchestrator::new(ctx, ports)),
            store,
            bridge,
            events: Some(events),
        }
    }

    /// Start the event loop; the returned token stops it
    fn dispatch(&mut self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let events = self.events.take().expect("dispatcher already running");
        let dispatcher = BridgeDispatcher::new(Arc::clone(&self.orchestrator), events);
        tokio::spawn(dispatcher.run(cancel.clone()));
        cancel
    }

    fn connect(&self, client_id: i64) {
        self.bridge.register_client(client_id, "0.26.0", Arc::new(TcpOpener));
    }

    async fn client(&self, client: Client) -> i64 {
        self.store.new_client(client).await.unwrap()
    }

    async fn persist(&self, task: Tunnel) -> Tunnel {
        let id = self.store.new_task(task).await.unwrap();
        self.store.get_task(id).await.unwrap()
    }
}

fn tcp_task(client_id: i64, target: &str) -> Tunnel {
    let mut task = Tunnel::new(0, client_id, Mode::Tcp);
    task.server_ip = "127.0.0.1".into();
    task.target = Target::new(target);
    task
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// `webServer` stand-in that counts closes
struct CountingService {
    closes: Arc<AtomicUsize>,
    cancel: CancellationToken,
    fail_start: bool,
}

#[async_trait::async_trait]
impl Service for CountingService {
    async fn start(&self) -> Result<(), ServerError> {
        if self.fail_start {
            return Err(ServerError::Protocol("refusing to start".into()));
        }
        self.cancel.cancelled().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        Ok(())
    }
}

fn counting_factory(closes: Arc<AtomicUsize>, fail_start: bool) -> WebServerFactory {
    Arc::new(move |_task: Arc<Tunnel>| {
        Arc::new(CountingService {
            closes: Arc::clone(&closes),
            cancel: CancellationToken::new(),
            fail_start,
        }) as Arc<dyn Service>
    })
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let mut task = tcp_task(1, "127.0.0.1:9");
    task.status = false;
    let task = h.persist(task).await;

    h.orchestrator.start_task(task.id).await.unwrap();
    assert!(h.orchestrator.is_running(task.id));
    assert!(h.store.get_task(task.id).await.unwrap().status);

    let again = h.orchestrator.add_task(h.store.get_task(task.id).await.unwrap());
    assert!(matches!(again, Err(ControlError::AlreadyRunning(id)) if id == task.id));

    h.orchestrator.stop_server(task.id).await.unwrap();
    assert!(!h.orchestrator.is_running(task.id));
    assert!(!h.store.get_task(task.id).await.unwrap().status);

    let second = h.orchestrator.stop_server(task.id).await;
    assert!(matches!(second, Err(ControlError::NotRunning(_))));
}

#[tokio::test]
async fn test_del_task_stops_and_removes_record() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let task = h.persist(tcp_task(1, "127.0.0.1:9")).await;
    h.orchestrator.add_task(task.clone()).unwrap();

    h.orchestrator.del_task(task.id).await.unwrap();
    assert!(!h.orchestrator.is_running(task.id));
    assert!(h.store.get_task(task.id).await.is_err());

    // Deleting an idle task only touches the store
    let idle = h.persist(tcp_task(1, "127.0.0.1:9")).await;
    h.orchestrator.del_task(idle.id).await.unwrap();
    assert!(h.store.get_task(idle.id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stops_close_once() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let closes = Arc::new(AtomicUsize::new(0));
    assert!(h
        .orchestrator
        .dispatcher()
        .set_web_server(counting_factory(closes.clone(), false)));

    let task = h.persist(Tunnel::new(0, 1, Mode::WebServer)).await;
    h.orchestrator.add_task(task.clone()).unwrap();

    let id = task.id;
    let mut stops = JoinSet::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&h.orchestrator);
        stops.spawn(async move { orchestrator.stop_server(id).await });
    }
    let mut stopped = 0;
    while let Some(result) = stops.join_next().await {
        match result.unwrap() {
            Ok(()) => stopped += 1,
            Err(ControlError::NotRunning(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(stopped, 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_add_and_stop_keep_one_handle() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let closes = Arc::new(AtomicUsize::new(0));
    h.orchestrator
        .dispatcher()
        .set_web_server(counting_factory(closes.clone(), false));
    let task = h.persist(Tunnel::new(0, 1, Mode::WebServer)).await;

    let mut ops = JoinSet::new();
    for i in 0..100 {
        let orchestrator = Arc::clone(&h.orchestrator);
        let task = task.clone();
        ops.spawn(async move {
            if i % 2 == 0 {
                match orchestrator.add_task(task) {
                    Ok(()) => (1, 0),
                    Err(ControlError::AlreadyRunning(_)) => (0, 0),
                    Err(e) => panic!("unexpected add error: {}", e),
                }
            } else {
                match orchestrator.stop_server(task.id).await {
                    Ok(()) => (0, 1),
                    Err(ControlError::NotRunning(_)) => (0, 0),
                    Err(e) => panic!("unexpected stop error: {}", e),
                }
            }
        });
    }
    let (mut adds, mut stops) = (0, 0);
    while let Some(result) = ops.join_next().await {
        let (added, stopped) = result.unwrap();
        adds += added;
        stops += stopped;
    }

    let live = usize::from(h.orchestrator.is_running(task.id));
    assert_eq!(closes.load(Ordering::SeqCst), stops);
    assert_eq!(adds, stops + live);
    assert!(h.orchestrator.running_count() <= 1);
}

#[tokio::test]
async fn test_failed_start_is_removed_from_registry() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    h.orchestrator
        .dispatcher()
        .set_web_server(counting_factory(Arc::new(AtomicUsize::new(0)), true));

    let task = h.persist(Tunnel::new(0, 1, Mode::WebServer)).await;
    h.orchestrator.add_task(task.clone()).unwrap();

    let id = task.id;
    let orchestrator = Arc::clone(&h.orchestrator);
    wait_until(move || !orchestrator.is_running(id)).await;
    // Administrator intent is untouched
    assert!(h.store.get_task(task.id).await.unwrap().status);
}

#[tokio::test]
async fn test_web_server_needs_factory() {
    let h = Harness::new(PortPolicy::allow_all());
    let result = h.orchestrator.add_task(Tunnel::new(3, 1, Mode::WebServer));
    assert!(matches!(result, Err(ControlError::ModeNotSupported(Mode::WebServer))));
    assert!(!h.orchestrator.is_running(3));
}

#[tokio::test]
async fn test_port_unavailable() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;

    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let mut task = tcp_task(1, "127.0.0.1:9");
    task.id = 40;
    task.port = taken.local_addr().unwrap().port();
    let result = h.orchestrator.add_task(task.clone());
    assert!(matches!(result, Err(ControlError::PortUnavailable { .. })));
    assert!(!h.orchestrator.is_running(40));

    let created = h.orchestrator.create_task(task).await;
    assert!(matches!(created, Err(ControlError::PortUnavailable { .. })));
    assert!(h.store.all_tasks().await.unwrap().is_empty());

    let restricted = Harness::new("8000-8100".parse().unwrap());
    let mut outside = tcp_task(1, "127.0.0.1:9");
    outside.id = 41;
    outside.port = 9000;
    assert!(matches!(
        restricted.orchestrator.add_task(outside),
        Err(ControlError::PortUnavailable { port: 9000, .. })
    ));
}

#[tokio::test]
async fn test_create_task_limits() {
    let h = Harness::new(PortPolicy::allow_all());
    let mut limited = Client::new(1, "vkey");
    limited.max_tunnel_num = 2;
    h.client(limited).await;
    h.client(Client::new(2, "other")).await;

    h.persist(tcp_task(1, "127.0.0.1:9")).await;
    h.store
        .new_host(Host {
            client_id: 1,
            host: "a.test".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = h.orchestrator.create_task(tcp_task(1, "127.0.0.1:9")).await;
    assert!(matches!(
        result,
        Err(ControlError::TunnelLimitExceeded { client_id: 1, max: 2 })
    ));

    let missing = h.orchestrator.create_task(tcp_task(99, "127.0.0.1:9")).await;
    assert!(matches!(missing, Err(ControlError::ClientNotFound(99))));

    let id = h.orchestrator.create_task(tcp_task(2, "127.0.0.1:9")).await.unwrap();
    assert!(h.orchestrator.is_running(id));

    // https tasks wait for host routing to start them
    let mut https = Tunnel::new(0, 2, Mode::Https);
    https.host = "secure.test".into();
    let https_id = h.orchestrator.create_task(https).await.unwrap();
    assert!(h.store.get_task(https_id).await.is_ok());
    assert!(!h.orchestrator.is_running(https_id));
}

#[tokio::test]
async fn test_reload_and_init_from_store() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let enabled = h.persist(tcp_task(1, "127.0.0.1:9")).await;
    let mut disabled = tcp_task(1, "127.0.0.1:9");
    disabled.status = false;
    let disabled = h.persist(disabled).await;

    assert_eq!(h.orchestrator.init_from_store().await.unwrap(), 1);
    assert!(h.orchestrator.is_running(enabled.id));
    assert!(!h.orchestrator.is_running(disabled.id));

    let mut edited = h.store.get_task(enabled.id).await.unwrap();
    edited.target = Target::new("127.0.0.1:10");
    h.store.update_task(&edited).await.unwrap();
    h.orchestrator.reload_task(enabled.id).await.unwrap();

    let running = h.orchestrator.running_task(enabled.id).unwrap();
    assert_eq!(running.tunnel.target.target_str, "127.0.0.1:10");

    // Reload also starts a task that was not running
    h.orchestrator.reload_task(disabled.id).await.unwrap();
    assert!(h.orchestrator.is_running(disabled.id));
    assert!(h.store.get_task(disabled.id).await.unwrap().status);
}

#[tokio::test]
async fn test_close_client_cascade() {
    let mut h = Harness::new(PortPolicy::allow_all());
    let mut client = Client::new(5, "ephemeral");
    client.no_store = true;
    h.client(client).await;
    h.connect(5);
    let cancel = h.dispatch();

    let mut ephemeral = Vec::new();
    for _ in 0..3 {
        let mut task = tcp_task(5, "127.0.0.1:9");
        task.no_store = true;
        let task = h.persist(task).await;
        h.orchestrator.add_task(task.clone()).unwrap();
        ephemeral.push(task.id);
    }
    let persistent = h.persist(tcp_task(5, "127.0.0.1:9")).await;
    h.orchestrator.add_task(persistent.clone()).unwrap();

    let mut secret = Tunnel::new(0, 5, Mode::Secret);
    secret.password = "kept".into();
    secret.no_store = true;
    let secret = h.persist(secret).await;
    h.orchestrator.add_task(secret.clone()).unwrap();

    h.store
        .new_host(Host {
            client_id: 5,
            host: "gone.test".into(),
            no_store: true,
            ..Default::default()
        })
        .await
        .unwrap();

    h.bridge.client_gone(5).await.unwrap();

    let store = h.store.clone();
    timeout(WAIT, async {
        while store.get_client(5).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    for id in ephemeral {
        assert!(!h.orchestrator.is_running(id));
        assert!(h.store.get_task(id).await.is_err());
    }
    assert!(h.orchestrator.is_running(persistent.id));
    assert!(h.orchestrator.is_running(secret.id));
    let left: Vec<i64> = h
        .store
        .tasks_by_client(5)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(left, vec![persistent.id, secret.id]);
    assert!(h.store.hosts_by_client(5).await.unwrap().is_empty());
    assert!(!h.bridge.is_connected(5));
    cancel.cancel();
}

#[tokio::test]
async fn test_open_and_close_task_events() {
    let mut h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let cancel = h.dispatch();
    let task = h.persist(tcp_task(1, "127.0.0.1:9")).await;
    let id = task.id;

    h.bridge.open_task(task.clone()).await.unwrap();
    let orchestrator = Arc::clone(&h.orchestrator);
    wait_until(move || orchestrator.is_running(id)).await;

    h.bridge.close_task(task).await.unwrap();
    let orchestrator = Arc::clone(&h.orchestrator);
    wait_until(move || !orchestrator.is_running(id)).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_secret_session_relays_to_target() {
    let mut h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    h.connect(1);
    let cancel = h.dispatch();

    let backend = echo_backend().await;
    let mut task = Tunnel::new(0, 1, Mode::Secret);
    task.password = "s3cret".into();
    task.target = Target::new(backend.to_string());
    let task = h.persist(task).await;
    h.orchestrator.add_task(task.clone()).unwrap();
    assert!(h.orchestrator.running_task(task.id).unwrap().is_placeholder());

    let (mut ours, theirs) = tokio::io::duplex(4096);
    h.bridge
        .secret(SecretSession::new(password_digest("s3cret"), Box::new(theirs)))
        .await
        .unwrap();
    ours.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, ours.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");

    // Unknown passwords drop the stream
    let (mut ours, theirs) = tokio::io::duplex(4096);
    h.bridge
        .secret(SecretSession::new(password_digest("wrong"), Box::new(theirs)))
        .await
        .unwrap();
    let mut buf = Vec::new();
    let n = timeout(WAIT, ours.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    cancel.cancel();
}

#[tokio::test]
async fn test_secret_for_disabled_task() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;
    let mut task = Tunnel::new(0, 1, Mode::Secret);
    task.password = "off".into();
    task.status = false;
    let task = h.persist(task).await;

    let (_ours, theirs) = tokio::io::duplex(64);
    let result = h
        .orchestrator
        .handle_secret(SecretSession::new(password_digest("off"), Box::new(theirs)))
        .await;
    assert!(matches!(result, Err(ControlError::TaskDisabled(id)) if id == task.id));

    let (_ours, theirs) = tokio::io::duplex(64);
    let result = h
        .orchestrator
        .handle_secret(SecretSession::new(password_digest("nobody"), Box::new(theirs)))
        .await;
    assert!(matches!(result, Err(ControlError::PasswordNotFound)));
}

async fn listing_fixture() -> Harness {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "zeta")).await;
    h.client(Client::new(2, "alpha")).await;
    let mut hidden = Client::new(3, "hidden");
    hidden.no_display = true;
    h.client(hidden).await;
    h.connect(1);

    for (client, remark, target) in [
        (1, "web", "10.0.0.3:80"),
        (2, "db", "10.0.0.1:5432"),
        (1, "api", "10.0.0.2:8080"),
        (2, "cache", "10.0.0.4:6379"),
    ] {
        let mut task = tcp_task(client, target);
        task.remark = remark.into();
        task.status = false;
        h.persist(task).await;
    }
    let mut udp = Tunnel::new(0, 2, Mode::Udp);
    udp.remark = "dns".into();
    udp.status = false;
    h.persist(udp).await;
    h
}

#[tokio::test]
async fn test_get_tunnel_sort_and_paginate() {
    let h = listing_fixture().await;
    h.orchestrator.add_task(h.store.get_task(3).await.unwrap()).unwrap();

    let all = h.orchestrator.get_tunnel(&TunnelQuery::default()).await.unwrap();
    assert_eq!(all.total, 5);
    let ids: Vec<i64> = all.rows.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(all.rows[2].run_status);
    assert!(!all.rows[0].run_status);
    assert!(all.rows[0].client.as_ref().unwrap().is_connect);
    assert!(!all.rows[1].client.as_ref().unwrap().is_connect);

    let query = TunnelQuery {
        sort: SortField::Remark,
        offset: 1,
        limit: 2,
        ..Default::default()
    };
    let page = h.orchestrator.get_tunnel(&query).await.unwrap();
    assert_eq!(page.total, 5);
    let remarks: Vec<&str> = page.rows.iter().map(|t| t.remark.as_str()).collect();
    assert_eq!(remarks, vec!["cache", "db"]);

    // Equal keys keep store order in both directions
    let by_client = TunnelQuery {
        sort: SortField::ClientId,
        order: SortOrder::Desc,
        ..Default::default()
    };
    let ids: Vec<i64> = h
        .orchestrator
        .get_tunnel(&by_client)
        .await
        .unwrap()
        .rows
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![2, 4, 5, 1, 3]);

    let by_key = TunnelQuery {
        sort: SortField::VerifyKey,
        mode: Some(Mode::Tcp),
        ..Default::default()
    };
    let ids: Vec<i64> = h
        .orchestrator
        .get_tunnel(&by_key)
        .await
        .unwrap()
        .rows
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![2, 4, 1, 3]);

    let search = TunnelQuery {
        search: "10.0.0.2".into(),
        ..Default::default()
    };
    let found = h.orchestrator.get_tunnel(&search).await.unwrap();
    assert_eq!(found.total, 1);
    assert_eq!(found.rows[0].remark, "api");
}

#[tokio::test]
async fn test_get_tunnel_v2_scopes_to_account() {
    let h = listing_fixture().await;
    let mut billed = tcp_task(2, "10.0.0.9:80");
    billed.account_id = 77;
    let billed = h.persist(billed).await;

    let page = h
        .orchestrator
        .get_tunnel_v2(77, None, &TunnelQuery::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.rows[0].id, billed.id);

    let other_client = h
        .orchestrator
        .get_tunnel_v2(77, Some(1), &TunnelQuery::default())
        .await
        .unwrap();
    assert_eq!(other_client.total, 0);
}

#[tokio::test]
async fn test_client_list_and_dashboard() {
    let h = listing_fixture().await;
    h.orchestrator.add_task(h.store.get_task(1).await.unwrap()).unwrap();

    let clients = h.orchestrator.get_client_list(&ClientQuery::default()).await.unwrap();
    assert_eq!(clients.total, 2);
    assert_eq!(clients.rows[0].id, 1);
    assert!(clients.rows[0].is_connect);
    assert_eq!(clients.rows[0].version, "0.26.0");
    assert!(!clients.rows[1].is_connect);
    assert!(clients.rows[1].version.is_empty());

    let dash = h.orchestrator.dashboard().await.unwrap();
    assert_eq!(dash.client_count, 3);
    assert_eq!(dash.client_online_count, 1);
    assert_eq!(dash.tcp_count, 4);
    assert_eq!(dash.udp_count, 1);
    assert_eq!(dash.running_count, 1);
    assert_eq!(dash.now_conn, 0);
}

#[tokio::test]
async fn test_health_marks_dead_target_down() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;

    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_addr = live.local_addr().unwrap().to_string();
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let mut task = tcp_task(1, &format!("{}\n{}", live_addr, dead_addr));
    task.health = Health {
        check_timeout: 1,
        max_fail: 1,
        check_interval: 60,
        check_type: HealthCheckType::Tcp,
        ..Default::default()
    };
    let task = h.persist(task).await;
    h.orchestrator.add_task(task.clone()).unwrap();

    let checker = HealthChecker::new(Arc::clone(&h.orchestrator), Duration::from_secs(1));
    let now = Instant::now();
    checker.check_due(now).await;

    let running = h.orchestrator.running_task(task.id).unwrap();
    assert!(running.tunnel.target.is_down(&dead_addr));
    assert!(!running.tunnel.target.is_down(&live_addr));
    assert_eq!(running.tunnel.target.select().unwrap(), live_addr);
    assert_eq!(running.tunnel.target.select().unwrap(), live_addr);
    assert_eq!(checker.failures(task.id, &dead_addr), 1);

    // Not due again until the interval passes
    checker.check_due(now).await;
    assert_eq!(checker.failures(task.id, &dead_addr), 1);
    checker.check_due(now + Duration::from_secs(61)).await;
    assert_eq!(checker.failures(task.id, &dead_addr), 2);
    drop(live);
}

#[tokio::test]
async fn test_health_checks_slow_tasks_side_by_side() {
    let h = Harness::new(PortPolicy::allow_all());
    h.client(Client::new(1, "vkey")).await;

    // Accepts and never answers, so every HTTP check runs into its timeout
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut ids = Vec::new();
    for _ in 0..2 {
        let mut task = tcp_task(1, &silent_addr);
        task.health = Health {
            check_timeout: 2,
            max_fail: 1,
            check_interval: 60,
            check_type: HealthCheckType::Http,
            http_url: "/healthz".into(),
            ..Default::default()
        };
        let task = h.persist(task).await;
        h.orchestrator.add_task(task.clone()).unwrap();
        ids.push(task.id);
    }

    let checker = HealthChecker::new(Arc::clone(&h.orchestrator), Duration::from_secs(1));
    let started = Instant::now();
    checker.check_due(started).await;
    assert!(started.elapsed() < Duration::from_millis(3500));
    for id in ids {
        assert_eq!(checker.failures(id, &silent_addr), 1);
    }
}
