//! rollgridd — the rollgrid daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Rollout reconciler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rollgridd run --port 8443 --data-dir /var/lib/rollgrid --config rollgrid.toml
//! rollgridd config > rollgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rollgrid_core::EngineConfig;
use rollgrid_rollout::{Reconciler, StoreBackend};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollgridd", about = "rollgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API and drive rollouts.
    Run {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/rollgrid")]
        data_dir: PathBuf,

        /// Engine configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollgridd=debug,rollgrid=debug"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            port,
            data_dir,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            run(port, data_dir, config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(port: u16, data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<()> {
    info!("rollgrid daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("rollgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = rollgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let reconciler = Arc::new(Reconciler::from_backend(
        StoreBackend::new(state.clone()),
        config.clone(),
    ));
    info!(
        resync_secs = config.reconcile.resync_interval_secs,
        timeout_secs = config.reconcile.timeout_secs,
        "reconciler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = rollgrid_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = reconciler_handle.await;

    info!("rollgrid daemon stopped");
    Ok(())
}
