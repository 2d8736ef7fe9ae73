use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tally_node::cli::{validated, CommonArgs};
use tally_node::config::ValidationMode;
use tally_node::coordinator::Coordinator;
use tally_node::operator;
use tally_node::reporter::Reporter;
use tally_node::server::CoordinatorServer;
use tally_node::shutdown::ShutdownSignal;
use tally_node::telemetry;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Round-robin counting coordinator
#[derive(Parser, Debug)]
#[command(name = "tally-coordinator")]
#[command(about = "Accepts turns from participants, broadcasts the count and recovers stalls")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Interface to listen on
    #[arg(long)]
    listen: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Only accept the expected value from the participant whose turn it is
    #[arg(long)]
    strict: bool,

    /// Silence in milliseconds before a contribution is simulated
    #[arg(long)]
    stall_threshold_ms: Option<u64>,

    /// Read operator commands (reset, send X, q) from stdin
    #[arg(long)]
    commands: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = args.common.load()?;
    let mut config = loaded.config;
    if let Some(listen) = args.listen {
        config.network.listen_interface = listen;
    }
    if let Some(port) = args.port {
        config.network.listen_port = port;
    }
    if args.strict {
        config.protocol.validation = ValidationMode::Strict;
    }
    if let Some(threshold) = args.stall_threshold_ms {
        config.stall.threshold_ms = threshold;
    }
    let config = validated(config)?;

    // Initialize structured logging
    telemetry::init_logging(&config.logging);
    if let Some(reason) = loaded.fallback_reason {
        warn!("{}", reason);
    }

    info!("Starting Tally Coordinator v{}", env!("CARGO_PKG_VERSION"));

    telemetry::start_metrics_exporter(&config.metrics)?;

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    let reporter = Arc::new(Reporter::stdout(config.display.console));
    let coordinator = Arc::new(Coordinator::new(&config, reporter.clone(), shutdown.token()));

    let listen_addr = config.listen_addr().context("Invalid listen address")?;
    let server = CoordinatorServer::bind(
        listen_addr,
        coordinator.clone(),
        config.protocol.format,
        config.network.max_participants,
    )
    .await
    .context("Failed to start coordinator")?;

    let stall_task = tokio::spawn(coordinator.clone().run_stall_loop());
    let stats_task = config.stats_interval().map(|period| {
        tokio::spawn(
            reporter
                .clone()
                .run_stats_loop(coordinator.state(), period, shutdown.token()),
        )
    });

    let operator_task = if args.commands {
        reporter.notice(operator::HELP);
        let (tx, rx) = mpsc::channel(16);
        operator::spawn_console(tx, shutdown.token());
        Some(tokio::spawn(coordinator.clone().run_operator_commands(rx)))
    } else {
        None
    };

    server.run().await?;

    // The server only returns once shutdown was requested
    stall_task.await.context("Stall detector task failed")?;
    if let Some(task) = stats_task {
        task.await.context("Statistics task failed")?;
    }
    if let Some(task) = operator_task {
        task.await.context("Operator task failed")?;
    }

    let snapshot = coordinator.snapshot();
    info!(
        total_accepted = snapshot.total_accepted,
        current_count = snapshot.current_count,
        "Coordinator stopped"
    );
    Ok(())
}
