use anyhow::{Context, Result};
use clap::Parser;
use tally_node::cli::{validated, CommonArgs};
use tally_node::participant::{self, ParticipantSettings};
use tally_node::shutdown::ShutdownSignal;
use tally_node::telemetry;
use tracing::{info, warn};

/// Participant that takes its turns through a coordinator
#[derive(Parser, Debug)]
#[command(name = "tally-participant")]
#[command(about = "Connects to a tally coordinator and sends a count whenever it is its turn")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Participant id in 0..N
    #[arg(long)]
    id: Option<u32>,

    /// Coordinator host
    #[arg(long)]
    host: Option<String>,

    /// Coordinator port
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not send the JOIN announcement after connecting
    #[arg(long)]
    no_announce: bool,

    /// Arm the restart watchdog (participant 0 only)
    #[arg(long)]
    watchdog: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = args.common.load()?;
    let mut config = loaded.config;
    if let Some(id) = args.id {
        config.participant.id = id;
    }
    if let Some(host) = args.host {
        config.network.coordinator_host = host;
    }
    if let Some(port) = args.port {
        config.network.coordinator_port = port;
    }
    if args.no_announce {
        config.participant.announce = false;
    }
    if args.watchdog {
        config.participant.watchdog_enabled = Some(true);
    }
    let config = validated(config)?;

    telemetry::init_logging(&config.logging);
    if let Some(reason) = loaded.fallback_reason {
        warn!("{}", reason);
    }

    info!(
        id = config.participant.id,
        "Starting Tally Participant v{}",
        env!("CARGO_PKG_VERSION")
    );

    telemetry::start_metrics_exporter(&config.metrics)?;

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    let target = config.coordinator_target();
    let stream = participant::connect(&target)
        .await
        .with_context(|| format!("Failed to connect to coordinator at {}", target))?;

    let settings = ParticipantSettings::from_config(&config, false);
    let summary = participant::run(stream, settings, shutdown.token()).await?;

    info!(
        sent = summary.sent,
        observed = summary.observed,
        last_expected = summary.last_expected,
        "Participant stopped"
    );
    Ok(())
}
