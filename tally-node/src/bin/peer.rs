use anyhow::{Context, Result};
use clap::Parser;
use tally_node::cli::{validated, CommonArgs};
use tally_node::group::GroupSocket;
use tally_node::participant::ParticipantSettings;
use tally_node::peer::run_peer;
use tally_node::shutdown::ShutdownSignal;
use tally_node::telemetry;
use tracing::{info, warn};

/// Peer that counts on a multicast group without a coordinator
#[derive(Parser, Debug)]
#[command(name = "tally-peer")]
#[command(about = "Joins a multicast group and takes round-robin turns with the other peers")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Participant id in 0..N
    #[arg(long)]
    id: Option<u32>,

    /// Multicast group address
    #[arg(long)]
    group: Option<String>,

    /// Multicast group port
    #[arg(long)]
    group_port: Option<u16>,

    /// Never restart the game after a long silence
    #[arg(long)]
    no_watchdog: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = args.common.load()?;
    let mut config = loaded.config;
    if let Some(id) = args.id {
        config.participant.id = id;
    }
    if let Some(group) = args.group {
        config.network.group_addr = group;
    }
    if let Some(port) = args.group_port {
        config.network.group_port = port;
    }
    if args.no_watchdog {
        config.participant.watchdog_enabled = Some(false);
    }
    let config = validated(config)?;

    telemetry::init_logging(&config.logging);
    if let Some(reason) = loaded.fallback_reason {
        warn!("{}", reason);
    }

    info!(
        id = config.participant.id,
        "Starting Tally Peer v{}",
        env!("CARGO_PKG_VERSION")
    );

    telemetry::start_metrics_exporter(&config.metrics)?;

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    let group = config.group_addr().context("Invalid multicast group address")?;
    let socket = GroupSocket::join(group, config.network.send_buffer_bytes, config.protocol.format)
        .with_context(|| format!("Failed to join multicast group {}", group))?;

    let settings = ParticipantSettings::from_config(&config, true);
    let result = run_peer(&socket, settings, shutdown.token()).await;
    socket.leave();

    let summary = result?;
    info!(
        sent = summary.sent,
        observed = summary.observed,
        last_expected = summary.last_expected,
        "Peer stopped"
    );
    Ok(())
}
