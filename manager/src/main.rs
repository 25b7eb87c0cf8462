//! The `gridmesh-manager` binary: loads configuration, wires the
//! scheduling core together, and runs the dispatcher timers until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use gridmesh_common::SlotTypeRegistry;
use gridmesh_manager::{
    AgentRegistry, EchoAgentClient, EventProducer, LocalLockFactory, ManagerConfig,
    ScheduleRepository, SchedulerDispatcher, StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gridmesh-manager", about = "GridMesh session scheduler")]
struct Args {
    /// Path to the manager configuration file (TOML).
    #[arg(short, long, env = "GRIDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `gridmesh_manager=debug`.
    #[arg(long, default_value = "info", env = "GRIDMESH_LOG")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .init();

    let config = ManagerConfig::load(args.config.as_deref())
        .context("failed to load manager configuration")?;
    info!(id = %config.id, "starting gridmesh manager");

    let repository = Arc::new(ScheduleRepository::new());
    let state = Arc::new(StateStore::new());
    let events = EventProducer::default();
    let slot_types = Arc::new(SlotTypeRegistry::with_intrinsic());
    let registry = Arc::new(AgentRegistry::new(
        repository,
        state,
        events,
        slot_types,
    ));
    let dispatcher = SchedulerDispatcher::new(
        registry,
        Arc::new(LocalLockFactory::new()),
        Arc::new(EchoAgentClient),
        config,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });
    dispatcher.run(shutdown).await;
    Ok(())
}
