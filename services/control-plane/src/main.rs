//! pit Control Plane
//!
//! Runs the scheduler: loads the fleet, restores persisted job state and
//! drives the reconciliation loop until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use pit_control_plane::{
    config,
    gateway::{GatewayClient, ScriptGateway},
    registry::Fleet,
    scheduler::{Scheduler, SchedulerWorker},
    store::StateStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PIT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting pit control plane");
    info!(
        fleet_file = %config.fleet_file.display(),
        state_db = %config.state_db.display(),
        scripts_dir = %config.scripts_dir.display(),
        "Configuration loaded"
    );

    let fleet = match Fleet::load(&config.fleet_file) {
        Ok(fleet) => {
            info!(nodes = fleet.nodes.len(), "Fleet loaded");
            fleet
        }
        Err(e) => {
            error!(error = %e, "Failed to load fleet");
            return Err(e.into());
        }
    };

    if let Some(parent) = config.state_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = StateStore::open(&config.state_db)?;

    let gateway = GatewayClient::new(
        Arc::new(ScriptGateway::new(&config.scripts_dir)),
        config.gateway_timeout,
    );
    let scheduler = Scheduler::restore(fleet, gateway, config.scheduler_settings(), store)?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_worker = SchedulerWorker::new(scheduler, config.tick_interval);
    let scheduler_handle = tokio::spawn(async move {
        scheduler_worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    // A cycle in flight may be waiting on gateway calls.
    let shutdown_timeout = config.gateway_timeout * 2;
    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
