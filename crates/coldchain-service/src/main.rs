//! Coldchain Service - MQTT ingestion with live fan-out and HTTP API.
//!
//! Run with: `cargo run -p coldchain-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use coldchain_service::{AppState, Collector, Config};
use coldchain_store::Store;

/// Coldchain Service - MQTT ingestion with live fan-out and HTTP API.
#[derive(Parser, Debug)]
#[command(name = "coldchain-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Compute bounds but never push them.
    #[arg(long)]
    no_sync: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coldchain_service=info".parse()?)
                .add_directive("coldchain_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    for name in config.apply_env() {
        info!("Using {} from environment", name);
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    config.validate()?;

    info!("Opening database at {:?}", config.storage.path);
    let store = Arc::new(Mutex::new(Store::open(&config.storage.path)?));

    let state = AppState::new(store, config.clone());
    let cancel = state.shutdown.clone();

    let mut collector = Collector::new(&state);
    if args.no_sync {
        collector = collector.without_sync();
    }
    let running = collector.start(cancel.clone())?;
    let retention = config.storage.retention_days.map(|days| {
        coldchain_service::retention::spawn(Arc::clone(&state.store), days, cancel.clone())
    });
    let state = state.with_collector(&running).shared();

    let app = coldchain_service::app(state);
    let addr: SocketAddr = config.server.bind.parse()?;
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    running.join().await;
    if let Some(task) = retention
        && let Err(e) = task.await
    {
        warn!("Retention task failed: {}", e);
    }
    info!("Service stopped");

    Ok(())
}
