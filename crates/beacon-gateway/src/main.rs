//! # beacon-gateway
//!
//! Beacon gateway binary. Loads settings, connects the broker, declares the
//! notification topology, starts the dispatch consumers and serves the
//! HTTP/WebSocket API until Ctrl-C.

#![deny(unsafe_code)]

mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_broker::{AmqpBroker, AmqpConfig, Broker, MemoryBroker};
use beacon_dispatch::{
    ConsumerConfig, DispatchContext, DispatchEngine, HandlerRegistry, notification_topology,
    spawn_all,
};
use beacon_server::{AppState, BeaconServer, ServerConfig, ShutdownCoordinator};
use beacon_settings::{BeaconSettings, BrokerBackend};
use beacon_store::{ConnectionConfig, NotificationStore};
use clap::Parser;
use tracing::{info, warn};

/// Beacon real-time gateway.
#[derive(Parser, Debug)]
#[command(name = "beacon-gateway", about = "Beacon real-time event gateway")]
struct Cli {
    /// Settings file (defaults to `$BEACON_CONFIG`, then `~/.beacon/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// AMQP URL (overrides settings).
    #[arg(long)]
    broker_url: Option<String>,

    /// Path to the `SQLite` notification database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Run against the in-process broker instead of AMQP.
    #[arg(long)]
    memory_broker: bool,
}

impl Cli {
    fn apply(&self, settings: &mut BeaconSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.broker_url {
            settings.broker.url.clone_from(url);
        }
        if let Some(path) = &self.db_path {
            settings.store.path = path.to_string_lossy().into_owned();
        }
        if self.memory_broker {
            settings.broker.backend = BrokerBackend::Memory;
        }
    }
}

fn server_config(settings: &BeaconSettings) -> ServerConfig {
    let server = &settings.server;
    ServerConfig {
        host: server.host.clone(),
        port: server.port,
        max_connections: server.max_connections,
        heartbeat_interval_secs: server.heartbeat_interval_secs,
        heartbeat_timeout_secs: server.heartbeat_timeout_secs,
        max_message_size: server.max_message_size,
        send_queue_capacity: server.send_queue_capacity,
        min_user_id_length: server.min_user_id_length,
        broker_ready_timeout_ms: settings.broker.ready_timeout_ms,
        broker_ready_poll_ms: settings.broker.ready_poll_ms,
        user_queue_ttl_secs: settings.broker.queue_ttl().as_secs(),
        user_queue_expiry_secs: settings.broker.user_queue_expiry().as_secs(),
        ..ServerConfig::default()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

async fn connect_broker(
    settings: &BeaconSettings,
    shutdown: &ShutdownCoordinator,
) -> Result<Arc<dyn Broker>> {
    match settings.broker.backend {
        BrokerBackend::Memory => {
            warn!("using in-process broker; events do not leave this process");
            Ok(Arc::new(MemoryBroker::new()))
        }
        BrokerBackend::Amqp => {
            let broker = AmqpBroker::new(AmqpConfig {
                url: settings.broker.url.clone(),
                prefetch: settings.broker.prefetch,
                reconnect: settings.broker.reconnect.clone(),
            });
            broker
                .connect_with_retry(settings.broker.connect_attempts)
                .await
                .context("failed to connect to broker")?;
            shutdown.track(broker.spawn_supervisor(shutdown.child_token()));
            Ok(Arc::new(broker))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(beacon_settings::settings_path);
    let mut settings = beacon_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    telemetry::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = beacon_server::metrics::install_recorder()
        .context("failed to install metrics recorder")?;

    // Store
    let db_path = PathBuf::from(&settings.store.path);
    ensure_parent_dir(&db_path)?;
    let store = NotificationStore::open_file(
        &settings.store.path,
        &ConnectionConfig {
            pool_size: settings.store.pool_size,
            busy_timeout_ms: settings.store.busy_timeout_ms,
        },
    )
    .context("failed to open notification store")?;
    info!(path = %settings.store.path, "notification store ready");

    // Broker and topology; a topology failure is fatal
    let shutdown = ShutdownCoordinator::new();
    let broker = connect_broker(&settings, &shutdown).await?;
    let handlers = Arc::new(HandlerRegistry::with_default_rules());
    let report = notification_topology(&handlers, settings.broker.queue_ttl())
        .declare(broker.as_ref())
        .await
        .context("failed to declare broker topology")?;
    info!(
        exchanges = report.exchanges,
        queues = report.queues,
        bindings = report.bindings,
        "broker topology declared"
    );

    // Gateway state
    let state = AppState::new(
        server_config(&settings),
        Arc::clone(&broker),
        store.clone(),
        handlers.routing_keys(),
        shutdown.token(),
    )
    .with_metrics(metrics);

    // Dispatch consumers share the gateway's push seam
    let ctx = DispatchContext::new(store, Arc::clone(&state.pusher))
        .with_dedup_window(settings.dispatch.dedup_window());
    let engine = DispatchEngine::new(Arc::clone(&handlers), ctx);
    let consumer_config = ConsumerConfig {
        tag_prefix: format!("beacon-{}", state.config.instance_id),
        ready_poll: settings.broker.ready_poll(),
        ..ConsumerConfig::default()
    };
    shutdown.track_all(spawn_all(
        &broker,
        &engine,
        &consumer_config,
        &shutdown.token(),
    ));
    info!(handlers = handlers.len(), "dispatch consumers started");

    // Server
    let server = BeaconServer::new(state);
    shutdown.track(server.spawn_fanout());
    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    shutdown.track(handle);
    info!(instance_id = %server.config().instance_id, "beacon gateway listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    shutdown.graceful_shutdown(None).await;
    info!("shutdown complete");
    Ok(())
}
