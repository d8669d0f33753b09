//! Outpost Edge Agent
//!
//! Dials out to the relay and forwards tunnelled traffic to a local target.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use outpost_agent::{AgentConfig, DirLogSource, EdgeAgent};
use outpost_core::tracing_init::init_tracing;
use outpost_proto::EdgeKey;

#[derive(Parser, Debug)]
#[command(name = "outpost-agent")]
#[command(version, about = "Outpost edge agent - outbound tunnel client")]
struct Args {
    /// Edge key issued by the relay at enrollment.
    #[arg(long, env = "OUTPOST_EDGE_KEY", hide_env_values = true)]
    edge_key: String,

    /// Stable identity of this host; the relay accepts only one per endpoint.
    #[arg(long, env = "OUTPOST_EDGE_ID")]
    edge_id: String,

    /// Local address tunnelled streams are forwarded to.
    #[arg(long, default_value = "127.0.0.1:2375")]
    target: String,

    /// Directory holding `{job_id}.log` output of scheduled jobs.
    #[arg(long, default_value = "/var/log/outpost/jobs")]
    job_log_dir: PathBuf,

    /// Seconds between tunnel heartbeats.
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("outpost_agent=info", args.log_json);

    let edge_key = EdgeKey::decode(args.edge_key.trim())?;
    let edge_id = args.edge_id.trim();
    if edge_id.is_empty() {
        anyhow::bail!("--edge-id must not be empty");
    }
    let mut config = AgentConfig::new(edge_key, edge_id, args.target);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs.max(1));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint_id = config.edge_key.endpoint_id,
        edge_id = %config.edge_id,
        relay = %config.edge_key.tunnel_addr(),
        target = %config.target_addr,
        "Starting outpost-agent"
    );

    let agent = Arc::new(EdgeAgent::new(
        config,
        Arc::new(DirLogSource::new(args.job_log_dir)),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runner = tokio::spawn(agent.run(shutdown_rx));

    tokio::select! {
        finished = &mut runner => {
            finished??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    runner.await??;

    info!("Agent stopped");
    Ok(())
}
