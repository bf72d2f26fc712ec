//! Tether Server
//!
//! Control plane that keeps agents connected, dispatches commands and
//! scripts to them, fires schedules, and moves files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_core::config::{Config, load_config};
use tether_core::tracing_init::{init_tracing, open_daily_log};

use tether_server::auth::JwtTokenIssuer;
use tether_server::hub;
use tether_server::storage::Database;
use tether_server::{ControlPlane, ControlPlaneOptions};

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(version, about = "Tether control plane - agent sessions, dispatch, schedules")]
struct Args {
    /// Address agents connect to. Overrides the config file.
    #[arg(long)]
    addr: Option<String>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Explicit config file, layered over the global one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Secret used to sign agent capability tokens.
    #[arg(long, env = "TETHER_TOKEN_SECRET", default_value = "dev-secret-change-me")]
    token_secret: String,

    /// Directory received files are written to.
    #[arg(long)]
    transfer_dir: Option<PathBuf>,

    /// Also write logs to `<dir>/Server/LogFile_<date>.log`.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// Do not run the schedule trigger in this process.
    #[arg(long)]
    no_schedules: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    apply_args(&mut config, &args);

    let log_file = match &config.logging.log_dir {
        Some(dir) => Some(open_daily_log(dir, "Server")?),
        None => None,
    };
    init_tracing("tether_server=info", config.logging.json, log_file);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        "Starting tether-server"
    );

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => default_data_dir()?.join("tether.db"),
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let transfer_dir = match &config.transfer.base_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?.join("shared"),
    };
    if args.token_secret == "dev-secret-change-me" {
        warn!("Using the development token secret; set TETHER_TOKEN_SECRET in production");
    }

    let plane = ControlPlane::new(
        db,
        Arc::new(JwtTokenIssuer::new(args.token_secret.as_bytes())),
        ControlPlaneOptions {
            command_timeout: config.dispatch.command_timeout(),
            token_ttl_secs: config.dispatch.token_ttl_minutes * 60,
            transfer_dir,
            chunk_size: config.transfer.chunk_size,
            outbound_queue_depth: config.server.outbound_queue_depth,
        },
    );

    let shutdown = CancellationToken::new();
    let schedule_tick = config
        .schedule
        .enabled
        .then(|| Duration::from_secs(config.schedule.tick_interval_secs.max(1)));
    let background =
        plane.spawn_background(schedule_tick, config.dispatch.reap_interval(), &shutdown);

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    let server = tokio::spawn(hub::serve(listener, plane.hub(), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown.cancel();

    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Agent listener failed"),
        Err(e) => warn!(error = %e, "Agent listener task panicked"),
        Ok(Ok(())) => {}
    }
    for handle in background {
        let _ = handle.await;
    }

    info!("Tether server stopped");
    Ok(())
}

/// CLI flags win over every other config layer.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(addr) = &args.addr {
        config.server.listen_addr.clone_from(addr);
    }
    if let Some(path) = &args.db_path {
        config.server.database_path = Some(path.clone());
    }
    if let Some(dir) = &args.transfer_dir {
        config.transfer.base_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.log_dir {
        config.logging.log_dir = Some(dir.clone());
    }
    if args.log_json {
        config.logging.json = true;
    }
    if args.no_schedules {
        config.schedule.enabled = false;
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    Ok(base.join("tether"))
}
