//! gpupool daemon
//!
//! Hosts the allocation engine: loads configuration, opens the store, seeds
//! the inventory and runs the stale-reservation sweeper until interrupted.

mod seed;

use anyhow::{Context, Result};
use clap::Parser;
use gpupool_core::{DaemonConfig, LoggingConfig, SystemClock};
use gpupool_scheduler::{AllocationEngine, ReservationSweeper};
use gpupool_store::{MemoryStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// gpupool daemon - GPU inventory and exclusive allocation engine
#[derive(Parser, Debug)]
#[command(name = "gpupoold")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides config and RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Snapshot file for durable state (overrides config)
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let filter = match level_override {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(path) = args.snapshot {
        config.storage.snapshot_path = Some(path);
    }

    init_logging(&config.logging, args.log_level.as_deref());

    info!("Starting gpupool daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn Store> = match &config.storage.snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::open(path.clone())
                .await
                .with_context(|| format!("opening snapshot {}", path.display()))?,
        ),
        None => {
            info!("No snapshot path configured, state is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(AllocationEngine::new(
        store,
        Arc::new(SystemClock::new()),
        config.engine.clone(),
    ));

    let stats = seed::apply(engine.inventory(), &config.clusters)
        .await
        .context("seeding inventory")?;
    info!(
        clusters = stats.clusters,
        nodes = stats.nodes,
        devices = stats.devices,
        "Inventory seeded"
    );

    for cluster in engine.inventory().list_clusters().await? {
        let summary = engine.inventory().cluster_summary(&cluster.id).await?;
        info!(
            cluster_id = %cluster.id,
            total = summary.total,
            free = summary.free,
            allocated = summary.allocated,
            offline = summary.offline,
            utilization = summary.utilization(),
            "Cluster inventory"
        );
    }

    let sweeper = ReservationSweeper::new(engine.clone(), config.engine.sweep_interval()).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    sweeper.shutdown().await;
    info!("gpupool daemon stopped");
    Ok(())
}
