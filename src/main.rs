//! Portgate - reverse tunnel broker
//!
//! Serves the configured tasks on public ports and relays their connections
//! to backends reached through connected clients.

use anyhow::{Context, Result};
use clap::Parser;
use portgate_api::StatusApi;
use portgate_bridge::SessionBridge;
use portgate_control::{BridgeDispatcher, HealthChecker, Orchestrator};
use portgate_proto::{Mode, Tunnel};
use portgate_relay::{AccountantConfig, ClientRuntimes, RelayConfig, RelayEngine, TrafficAccountant};
use portgate_server::{HostRoutes, PortPolicy, ServerContext, ServerSettings};
use portgate_store::{MemoryStore, Seed, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Registry ids of the built-in tasks; persisted tasks are numbered from 1
const STATUS_API_TASK_ID: i64 = -1;
const HOST_SERVER_TASK_ID: i64 = -2;

/// Bridge events buffered before the transport is back-pressured
const BRIDGE_EVENT_CAPACITY: usize = 1024;

/// Portgate - reverse tunnel broker
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(about = "Portgate - expose services behind NAT through connected clients")]
#[command(version)]
struct ServerArgs {
    /// JSON file with clients, tasks, hosts and accounts to load at startup
    #[arg(long, env = "PORTGATE_SEED")]
    seed: Option<PathBuf>,

    /// Port of the shared Host-header listener (0 disables it)
    #[arg(long, env = "PORTGATE_HTTP_PROXY_PORT", default_value = "80")]
    http_proxy_port: u16,

    /// Port of the shared TLS SNI listener (0 disables it)
    #[arg(long, env = "PORTGATE_HTTPS_PROXY_PORT", default_value = "443")]
    https_proxy_port: u16,

    /// Address the shared host listeners bind
    #[arg(long, env = "PORTGATE_HOST_BIND_IP", default_value = "0.0.0.0")]
    host_bind_ip: String,

    /// Ports tasks may bind, e.g. "8000-9000,10022" (empty allows all)
    #[arg(long, env = "PORTGATE_ALLOW_PORTS", default_value = "")]
    allow_ports: String,

    /// Seconds between traffic flushes
    #[arg(long, env = "PORTGATE_FLUSH_INTERVAL_SECS", default_value = "5")]
    flush_interval_secs: u64,

    /// Pending bytes per account that force a flush
    #[arg(long, env = "PORTGATE_FLUSH_THRESHOLD_BYTES", default_value = "1048576")]
    flush_threshold_bytes: i64,

    /// Relay pairs served at once
    #[arg(long, env = "PORTGATE_MAX_RELAY_PAIRS", default_value = "100000")]
    max_relay_pairs: usize,

    /// Directional copy jobs running at once
    #[arg(long, env = "PORTGATE_MAX_COPY_JOBS", default_value = "200000")]
    max_copy_jobs: usize,

    /// Seconds between health checker rounds
    #[arg(long, env = "PORTGATE_HEALTH_TICK_SECS", default_value = "1")]
    health_tick_secs: u64,

    /// Seconds before an idle UDP session is dropped
    #[arg(long, env = "PORTGATE_UDP_IDLE_SECS", default_value = "60")]
    udp_idle_secs: u64,

    /// Status API address (empty disables it)
    #[arg(long, env = "PORTGATE_WEB_ADDR", default_value = "127.0.0.1:8081")]
    web_addr: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, env = "PORTGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl ServerArgs {
    fn server_settings(&self) -> ServerSettings {
        let port = |p: u16| (p != 0).then_some(p);
        ServerSettings {
            http_proxy_port: port(self.http_proxy_port),
            https_proxy_port: port(self.https_proxy_port),
            host_bind_ip: self.host_bind_ip.clone(),
            udp_idle_timeout: Duration::from_secs(self.udp_idle_secs),
        }
    }

    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_pairs: self.max_relay_pairs,
            max_copy_jobs: self.max_copy_jobs,
            ..Default::default()
        }
    }

    fn accountant_config(&self) -> AccountantConfig {
        AccountantConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            flush_threshold: self.flush_threshold_bytes,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn open_store(seed: Option<&PathBuf>) -> Result<Arc<dyn Store>> {
    let Some(path) = seed else {
        info!("No seed file given, starting with an empty store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let seed = Seed::load(path)
        .await
        .with_context(|| format!("Failed to load seed file {}", path.display()))?;
    info!(
        clients = seed.clients.len(),
        tasks = seed.tasks.len(),
        hosts = seed.hosts.len(),
        "Loaded seed file {}",
        path.display()
    );
    Ok(Arc::new(MemoryStore::from_seed(seed)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    setup_logging(&args.log_level);
    info!("Starting portgate {}", env!("CARGO_PKG_VERSION"));

    let ports: PortPolicy = args
        .allow_ports
        .parse()
        .context("Invalid --allow-ports value")?;
    let store = open_store(args.seed.as_ref()).await?;
    let shutdown = CancellationToken::new();

    let accountant = Arc::new(TrafficAccountant::new(
        Arc::clone(&store),
        args.accountant_config(),
    ));
    let flusher = accountant.spawn_flusher(shutdown.child_token());

    // Transports register authenticated clients on the bridge
    let (bridge, events) = SessionBridge::new(BRIDGE_EVENT_CAPACITY);
    let ctx = ServerContext {
        store: Arc::clone(&store),
        bridge,
        engine: Arc::new(RelayEngine::new(args.relay_config(), accountant)),
        clients: Arc::new(ClientRuntimes::new()),
        routes: Arc::new(HostRoutes::new(Arc::clone(&store))),
        settings: args.server_settings(),
    };
    let host_listeners = ctx.settings.http_proxy_port.is_some() || ctx.settings.https_proxy_port.is_some();

    let orchestrator = Arc::new(Orchestrator::new(ctx, ports));
    orchestrator.dispatcher().set_web_server(StatusApi::factory(
        Arc::downgrade(&orchestrator),
        args.web_addr.clone(),
    ));

    let loaded = orchestrator
        .init_from_store()
        .await
        .context("Failed to load tasks")?;
    info!(tasks = loaded, "Persisted tasks started");

    if host_listeners {
        let task = Tunnel::new(HOST_SERVER_TASK_ID, 0, Mode::HttpHostServer);
        if let Err(e) = orchestrator.add_task(task) {
            error!("Failed to start host listeners: {}", e);
        }
    }
    if !args.web_addr.is_empty() {
        let task = Tunnel::new(STATUS_API_TASK_ID, 0, Mode::WebServer);
        if let Err(e) = orchestrator.add_task(task) {
            error!("Failed to start status API: {}", e);
        }
    }

    let dispatcher = tokio::spawn(
        BridgeDispatcher::new(Arc::clone(&orchestrator), events).run(shutdown.child_token()),
    );
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&orchestrator),
        Duration::from_secs(args.health_tick_secs.max(1)),
    ))
    .spawn(shutdown.child_token());

    info!("Portgate is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    orchestrator.shutdown().await;
    shutdown.cancel();
    for (name, handle) in [("dispatcher", dispatcher), ("health checker", health), ("traffic flusher", flusher)] {
        if let Err(e) = handle.await {
            warn!("{} did not stop cleanly: {}", name, e);
        }
    }

    info!("Portgate stopped");
    Ok(())
}
