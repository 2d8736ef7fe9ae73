use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tally_node::cli::{validated, CommonArgs};
use tally_node::group::GroupSocket;
use tally_node::monitor::{run_monitor, Monitor, MonitorMode};
use tally_node::operator;
use tally_node::reporter::Reporter;
use tally_node::shutdown::ShutdownSignal;
use tally_node::telemetry;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Passive observer of a multicast counting group
#[derive(Parser, Debug)]
#[command(name = "tally-monitor")]
#[command(about = "Watches a multicast counting group, reports throughput and audits the sequence")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// observe prints who is stalling, simulate sends the missing count
    #[arg(long, default_value_t = MonitorMode::Observe)]
    mode: MonitorMode,

    /// Multicast group address
    #[arg(long)]
    group: Option<String>,

    /// Multicast group port
    #[arg(long)]
    group_port: Option<u16>,

    /// Read operator commands (reset, send X, stats, gaps, q) from stdin
    #[arg(long)]
    commands: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = args.common.load()?;
    let mut config = loaded.config;
    if let Some(group) = args.group {
        config.network.group_addr = group;
    }
    if let Some(port) = args.group_port {
        config.network.group_port = port;
    }
    let config = validated(config)?;

    telemetry::init_logging(&config.logging);
    if let Some(reason) = loaded.fallback_reason {
        warn!("{}", reason);
    }

    info!(mode = %args.mode, "Starting Tally Monitor v{}", env!("CARGO_PKG_VERSION"));

    telemetry::start_metrics_exporter(&config.metrics)?;

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    let group = config.group_addr().context("Invalid multicast group address")?;
    let socket = GroupSocket::join(group, config.network.send_buffer_bytes, config.protocol.format)
        .with_context(|| format!("Failed to join multicast group {}", group))?;

    let reporter = Arc::new(Reporter::stdout(config.display.console));
    let mut monitor = Monitor::new(&config, args.mode, reporter.clone());

    let stats_task = config.stats_interval().map(|period| {
        tokio::spawn(
            reporter
                .clone()
                .run_stats_loop(monitor.state(), period, shutdown.token()),
        )
    });

    let commands = if args.commands {
        reporter.notice(operator::HELP);
        let (tx, rx) = mpsc::channel(16);
        operator::spawn_console(tx, shutdown.token());
        Some(rx)
    } else {
        None
    };

    let result = run_monitor(
        &socket,
        &mut monitor,
        config.stall_tick(),
        commands,
        shutdown.token(),
    )
    .await;
    socket.leave();

    // run_monitor only returns once shutdown was requested or the socket failed
    shutdown.initiate_shutdown();
    if let Some(task) = stats_task {
        task.await.context("Statistics task failed")?;
    }

    let summary = result?;
    if summary.missing > 0 || summary.duplicates > 0 {
        warn!(
            missing = summary.missing,
            duplicates = summary.duplicates,
            "Sequence had irregularities"
        );
    }
    Ok(())
}
