//! nimbusd — the Nimbus daemon.
//!
//! Single binary that assembles the provisioning control plane:
//! - State store (redb) + lock manager
//! - Backend registry and offer source
//! - Instance provisioner (pending + terminating passes)
//! - Health reconciler
//! - Run manager passes (runs, terminating runs, scheduled runs)
//! - Fleet pass + placement group cleanup
//!
//! # Usage
//!
//! ```text
//! nimbusd standalone --data-dir /var/lib/nimbus
//! ```
//!
//! Compute backend drivers register through [`run_control_plane`]; the
//! stock binary starts with an empty registry and only reconciles
//! already-known state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use nimbus_backend::BackendRegistry;
use nimbus_health::{HealthReconciler, InstanceProbe};
use nimbus_offers::OfferSource;
use nimbus_placement::PlacementCoordinator;
use nimbus_provision::Provisioner;
use nimbus_run::RunManager;
use nimbus_state::{LockManager, StateStore};

mod probe;

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus provisioning control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (all reconciliation loops in one process).
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/nimbus")]
        data_dir: PathBuf,

        /// Pending-instance pass interval in seconds.
        #[arg(long, default_value = "10")]
        provision_interval: u64,

        /// Terminating-instance pass interval in seconds.
        #[arg(long, default_value = "30")]
        termination_interval: u64,

        /// Health pass interval in seconds.
        #[arg(long, default_value = "30")]
        health_interval: u64,

        /// Run passes interval in seconds.
        #[arg(long, default_value = "10")]
        run_interval: u64,

        /// Placement-group/fleet cleanup interval in seconds.
        #[arg(long, default_value = "300")]
        cleanup_interval: u64,
    },
}

/// Loop intervals for the background passes.
pub struct Intervals {
    pub provision: Duration,
    pub termination: Duration,
    pub health: Duration,
    pub runs: Duration,
    pub cleanup: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nimbusd=debug,nimbus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            provision_interval,
            termination_interval,
            health_interval,
            run_interval,
            cleanup_interval,
        } => {
            std::fs::create_dir_all(&data_dir)?;
            let state = StateStore::open(&data_dir.join("nimbus.redb"))?;

            // Drivers are linked in by deployment-specific builds; the
            // stock binary reconciles with whatever is registered.
            let registry = BackendRegistry::new();
            if registry.is_empty() {
                warn!("no compute backends configured; pending instances will find no offers");
            }

            let probe = Arc::new(probe::TcpProbe::default());
            run_control_plane(
                state,
                Arc::new(registry),
                probe,
                Intervals {
                    provision: Duration::from_secs(provision_interval),
                    termination: Duration::from_secs(termination_interval),
                    health: Duration::from_secs(health_interval),
                    runs: Duration::from_secs(run_interval),
                    cleanup: Duration::from_secs(cleanup_interval),
                },
            )
            .await
        }
    }
}

/// Assemble the subsystems and run all reconciliation loops until Ctrl-C.
pub async fn run_control_plane(
    state: StateStore,
    registry: Arc<BackendRegistry>,
    probe: Arc<dyn InstanceProbe>,
    intervals: Intervals,
) -> anyhow::Result<()> {
    info!(backends = ?registry.kinds(), "nimbus control plane starting");

    let locks = Arc::new(LockManager::new());
    let offers = Arc::new(OfferSource::new(registry.clone()));

    let provisioner = Arc::new(Provisioner::new(
        state.clone(),
        locks.clone(),
        registry.clone(),
        offers.clone(),
    ));
    let health = Arc::new(HealthReconciler::new(state.clone(), locks.clone(), probe));
    let runs = Arc::new(RunManager::new(state.clone(), locks.clone(), offers));
    let fleets = Arc::new(nimbus_fleet::FleetManager::new(state.clone(), locks.clone()));
    let placement = PlacementCoordinator::new(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Background passes ──────────────────────────────────────────

    {
        let provisioner = provisioner.clone();
        handles.push(spawn_loop(
            "pending-instances",
            intervals.provision,
            shutdown_rx.clone(),
            move |now| {
                let provisioner = provisioner.clone();
                async move { provisioner.process_pending_instances(now).await.map_err(anyhow::Error::from) }
            },
        ));
    }
    {
        let provisioner = provisioner.clone();
        handles.push(spawn_loop(
            "terminating-instances",
            intervals.termination,
            shutdown_rx.clone(),
            move |now| {
                let provisioner = provisioner.clone();
                async move {
                    provisioner
                        .process_terminating_instances(now)
                        .await
                        .map_err(anyhow::Error::from)
                }
            },
        ));
    }
    {
        let health = health.clone();
        handles.push(spawn_loop(
            "health",
            intervals.health,
            shutdown_rx.clone(),
            move |now| {
                let health = health.clone();
                async move { health.run_pass(now).await.map_err(anyhow::Error::from) }
            },
        ));
    }
    {
        let runs = runs.clone();
        handles.push(spawn_loop(
            "runs",
            intervals.runs,
            shutdown_rx.clone(),
            move |now| {
                let runs = runs.clone();
                async move {
                    runs.process_scheduled_runs(now).await?;
                    runs.process_runs(now).await?;
                    runs.process_terminating_runs(now).await?;
                    Ok(())
                }
            },
        ));
    }
    {
        let registry = registry.clone();
        handles.push(spawn_loop(
            "cleanup",
            intervals.cleanup,
            shutdown_rx.clone(),
            move |_now| {
                let fleets = fleets.clone();
                let placement = placement.clone();
                let registry = registry.clone();
                async move {
                    fleets.process_fleets().await?;
                    placement.cleanup_pass(&registry).await?;
                    Ok(())
                }
            },
        ));
    }

    // ── Shutdown ───────────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("nimbus control plane stopped");
    Ok(())
}

/// Spawn one reconciliation loop with a shutdown channel.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    pass: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(u64) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        info!(pass = name, interval_secs = interval.as_secs(), "reconciliation loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = pass(epoch_secs()).await {
                        error!(pass = name, error = %e, "reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(pass = name, "reconciliation loop shutting down");
                    break;
                }
            }
        }
    })
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
