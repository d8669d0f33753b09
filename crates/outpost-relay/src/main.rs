//! Outpost Relay Server
//!
//! Reverse tunnel server and edge job dispatcher for edge agents.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use outpost_core::config::load_config;
use outpost_core::tracing_init::init_tracing;
use outpost_relay::app::Relay;

#[derive(Parser, Debug)]
#[command(name = "outpost-relay")]
#[command(version, about = "Outpost relay - reverse tunnels and edge jobs")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address agents connect to.
    #[arg(long)]
    tunnel_addr: Option<String>,

    /// Host embedded in edge keys.
    #[arg(long)]
    public_host: Option<String>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Directory for edge job scripts and logs.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum concurrently active tunnels.
    #[arg(long)]
    max_tunnels: Option<usize>,

    /// Provision per-user Kubernetes credentials.
    #[arg(long, env = "OUTPOST_KUBE_ENABLED")]
    kube: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("outpost_relay=info", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.tunnel_addr {
        config.relay.tunnel_addr = addr;
    }
    if let Some(host) = args.public_host {
        config.relay.public_host = host;
    }
    if let Some(path) = args.db_path {
        config.relay.database_path = Some(path);
    }
    if let Some(dir) = args.data_dir {
        config.relay.data_dir = Some(dir);
    }
    if let Some(max) = args.max_tunnels {
        config.relay.max_tunnels = max;
    }
    if args.kube {
        config.kube.enabled = true;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnel_addr = %config.relay.tunnel_addr,
        "Starting outpost-relay"
    );

    let relay = Relay::build(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(Arc::clone(&relay.tunnel).serve(relay.listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    server.await??;

    info!("Relay stopped");
    Ok(())
}
