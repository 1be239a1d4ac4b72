use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use cuesync_runtime::{telemetry, Conductor, ConductorConfig};
use cuesync_time::MonotonicClock;
use cuesync_transport::UdpTransport;

#[derive(Parser)]
#[command(name = "cuesync-conductor", version, about = "CUESYNC clock sync and cue dispatch conductor")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address from the configuration
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConductorConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConductorConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    telemetry::init(cli.json || config.json_logs).context("Failed to install tracing subscriber")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ConductorConfig) -> Result<()> {
    let clock = Arc::new(MonotonicClock::new());
    let transport = Arc::new(
        UdpTransport::bind(config.bind, clock.clone())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?,
    );
    for peer in &config.peers {
        transport.add_peer(peer.id, peer.addr);
        tracing::info!(node = %peer.id, addr = %peer.addr, "static peer");
    }

    let conductor = Conductor::new(config, Arc::clone(&transport), clock)
        .context("Invalid configuration")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    conductor.run(shutdown).await?;

    let stats = conductor.stats();
    tracing::info!(
        ticks = stats.ticks,
        frames_in = stats.frames_in,
        probes_sent = stats.probes_sent,
        authority_changes = stats.authority_changes,
        "conductor stopped"
    );
    Ok(())
}
