//! Acquisition service binary
//!
//! Bootstrap order: arguments, configuration, logging, bus, metadata
//! store, telemetry/status plumbing, connection manager, dispatcher,
//! reconciler, health API, then block on the shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use acqsrv::api::{create_router, AppState};
use acqsrv::core::dispatcher::Dispatcher;
use acqsrv::core::emitter::{StatusPublisher, TelemetryEmitter};
use acqsrv::core::manager::ConnectionManager;
use acqsrv::core::reconcile::Reconciler;
use acqsrv::core::store::MetaStore;
use acqsrv::{AcqError, DefaultDriverFactory, ServiceConfig};
use edge_bus::{Bus, RedisBus};

#[derive(Parser, Debug, Clone)]
#[command(name = "acqsrv", about = "Industrial connection & tag acquisition engine")]
struct Args {
    /// Configuration file (YAML); env vars ACQSRV_* override
    #[arg(short, long, env = "ACQSRV_CONFIG")]
    config: Option<String>,

    /// Log level override (trace|debug|info|warn|error)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate configuration and the metadata store, then exit
    #[arg(long)]
    validate: bool,
}

fn init_logging(config: &ServiceConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("acqsrv={level},edge_bus={level},warn")));

    match &config.logging.path {
        Some(path) => {
            let appender = tracing_appender::rolling::daily(path, "acqsrv.log");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref())?;
    init_logging(&config, args.log_level.as_deref());

    info!(
        "{} v{} starting (bus {}, db {})",
        config.service_id,
        env!("CARGO_PKG_VERSION"),
        config.bus_url,
        config.database_url
    );

    // Metadata store first: without it nothing can run
    let store = Arc::new(MetaStore::connect(&config.database_url).await?);

    if args.validate {
        if !store.is_healthy().await {
            return Err(AcqError::store("Metadata store not reachable".to_string()).into());
        }
        let connections = store.load_enabled_connections().await?;
        for connection in &connections {
            connection.kind().map_err(AcqError::from)?;
        }
        info!("Validation OK ({} enabled connections)", connections.len());
        return Ok(());
    }

    // Bus
    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&config.bus_url).await?);

    // Telemetry and status plumbing
    let status = Arc::new(StatusPublisher::new(Arc::clone(&bus)));
    let (emitter, emitter_task) =
        TelemetryEmitter::start(Arc::clone(&bus), Arc::clone(&store), Arc::clone(&status));

    // Connection manager with the production driver factory
    let factory = Arc::new(DefaultDriverFactory::new(
        Arc::clone(&bus),
        config.eip.clone(),
    ));
    let manager = ConnectionManager::new(
        Arc::clone(&store),
        Arc::clone(&emitter),
        Arc::clone(&status),
        factory,
        config.max_connections_per_host,
    );

    // Bus-driven configuration
    let mut dispatcher = Dispatcher::new(Arc::clone(&bus), Arc::clone(&manager), Arc::clone(&emitter));
    dispatcher.start().await?;

    // Boot the enabled connection set from the store
    manager.boot().await?;

    // Reconciler
    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(
        Arc::clone(&manager),
        Arc::clone(&store),
        config.reconcile_interval_s,
    );
    let reconciler_task = reconciler.start(shutdown.clone());

    // Health API
    let state = AppState {
        service_id: config.service_id.clone(),
        manager: Arc::clone(&manager),
        status,
        bus,
        store,
    };
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| AcqError::config(format!("Bind address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health API on http://{}", addr);
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, create_router(state)).await {
            error!("API server failed: {}", e);
        }
    });

    // Block until shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    dispatcher.stop();
    manager.shutdown().await;
    reconciler_task.abort();
    api_task.abort();
    emitter_task.abort();
    info!("Bye");
    Ok(())
}
