//! Protoss coordination node
//!
//! Hosts the event bus, coordinator, observer and archiver in one process,
//! behind a WebSocket server for the grid, the bus bridge and the gateway.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: grid on 127.0.0.1:8888, units launched via `protoss-unit`
//! protoss-node
//!
//! # Config file plus overrides
//! PROTOSS_MAX_UNITS=5 protoss-node --config protoss.toml --grid-addr 0.0.0.0:9000
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use protoss_coordination::archiver::{Archiver, MemoryStore};
use protoss_coordination::grid::transport;
use protoss_coordination::{
    BusBridge, Coordinator, CoordinatorConfig, EventBus, Gateway, GatewayConfig, Grid, NodeConfig,
    Observer, ObserverConfig, ProcessSpawner,
};
use tokio_util::sync::CancellationToken;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Grid listen address (overrides PROTOSS_GRID_ADDR)
    #[arg(long)]
    grid_addr: Option<String>,

    /// Maximum live units per channel (overrides PROTOSS_MAX_UNITS)
    #[arg(long)]
    max_units: Option<usize>,

    /// Completion debounce in milliseconds (overrides PROTOSS_COMPLETION_GRACE_MS)
    #[arg(long)]
    completion_grace_ms: Option<u64>,

    /// Unit executable (overrides PROTOSS_SPAWN_PROGRAM)
    #[arg(long)]
    spawn_program: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("protoss_coordination=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grid_addr {
        config.grid_addr = addr;
    }
    if let Some(max) = args.max_units {
        config.max_units = max;
    }
    if let Some(ms) = args.completion_grace_ms {
        config.completion_grace_ms = ms;
    }
    if let Some(program) = args.spawn_program {
        config.spawn_program = program;
    }
    config.validate()?;

    tracing::info!(
        "Node config: grid={}, max_units={}, grace={}ms, unit_types={:?}",
        config.grid_addr,
        config.max_units,
        config.completion_grace_ms,
        config.unit_types
    );

    let registry = config.registry()?;
    let bus = EventBus::new().shared();

    let coordinator = Coordinator::new(
        bus.clone(),
        CoordinatorConfig {
            completion_grace: config.completion_grace(),
        },
    )
    .shared();
    coordinator.start();

    let spawner = Arc::new(ProcessSpawner::new(
        &config.spawn_program,
        config.spawn_args.clone(),
        registry.clone(),
    ));
    let observer = Observer::new(
        bus.clone(),
        coordinator.clone(),
        spawner.clone(),
        registry,
        ObserverConfig {
            max_units: config.max_units,
            endpoint: config.grid_url(),
        },
    );
    observer.start();

    let store = MemoryStore::new().shared();
    let archiver = Archiver::new(bus.clone(), store.clone());
    archiver.start();

    let grid = Grid::new().shared();
    grid.start();
    let gateway = Gateway::new(
        bus.clone(),
        coordinator.clone(),
        GatewayConfig {
            vision_roster: config.roster()?,
        },
    )
    .shared();
    let bridge = BusBridge::new(bus.clone(), coordinator.clone(), store).shared();

    let shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(config.socket_addr()?).await?;
    let app = transport::router(grid.clone(), gateway, bridge, shutdown.clone());
    let server = tokio::spawn(transport::serve(listener, app, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    if let Err(e) = server.await? {
        tracing::warn!("Server error during shutdown: {}", e);
    }
    observer.stop().await;
    coordinator.stop().await;
    archiver.stop().await;
    grid.stop().await;
    bus.close();
    spawner.shutdown();

    Ok(())
}
