//! fleetd binary entry point.
//!
//! ```text
//! fleetd run --config /etc/fleetd/fleetd.toml
//! fleetd print-config > fleetd.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fleet_lifecycle::NodeLifecycle;
use fleet_state::StateStore;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetd::config::{FleetdConfig, LogFormat};
use fleetd::controller::Controller;
use fleetd::leader::{LeaderElection, release_after};
use fleetd::reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and the REST API.
    Run {
        /// Path to fleetd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `controller.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override `api.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override `controller.id`.
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the effective default configuration.
    PrintConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            listen,
            id,
        } => {
            let mut config = match config {
                Some(path) => FleetdConfig::from_file(&path)?,
                None => FleetdConfig::default(),
            };
            if let Some(dir) = data_dir {
                config.controller.data_dir = dir;
            }
            if let Some(addr) = listen {
                config.api.listen = addr;
            }
            if let Some(id) = id {
                config.controller.id = id;
            }
            init_tracing(config.controller.log_format);
            run(config).await
        }
        Command::PrintConfig => {
            print!("{}", FleetdConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: FleetdConfig) -> anyhow::Result<()> {
    info!(id = %config.controller.id, "fleet daemon starting");

    std::fs::create_dir_all(&config.controller.data_dir)?;
    let db_path = config.controller.data_dir.join("fleetd.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let providers = fleetd::build_providers(&config.provider);
    info!(kind = ?config.provider.kind, "providers initialized");

    let lifecycle = Arc::new(NodeLifecycle::new(
        providers.cloud,
        providers.cluster,
        store.clone(),
        config.lifecycle,
    ));
    let reconciler = Reconciler::new(
        lifecycle,
        config.analyzer,
        config.executor.clone(),
        config.controller.resync_interval_secs,
    );
    let controller = Controller::new(reconciler, config.controller.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Fired only once the controller has stopped.
    let (release_tx, release_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let election = LeaderElection::new(store.clone(), config.controller.id.clone(), &config.leader);
    let (leader_handle, leader_rx) = election.start(release_rx);
    let controller_handle = tokio::spawn(controller.run(leader_rx, shutdown_rx.clone()));

    // ── API server ─────────────────────────────────────────────

    let router = fleet_api::build_router(store);
    let listener = tokio::net::TcpListener::bind(config.api.listen).await?;
    info!(addr = %config.api.listen, "API server starting");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // The controller bounds its own drain by shutdown_grace_secs.
    let grace = Duration::from_secs(config.controller.shutdown_grace_secs + 5);
    release_after(controller_handle, grace, release_tx, leader_handle).await;

    info!("fleet daemon stopped");
    Ok(())
}
