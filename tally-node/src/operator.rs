use std::fmt;
use std::io::{self, BufRead};
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands typed on the coordinator or monitor console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Restart the count at 0
    Reset,
    /// Inject a count by hand
    Send(i64),
    /// Print throughput statistics now
    Stats,
    /// Print the gap analysis now
    Gaps,
    /// Stop the process
    Quit,
}

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("reset"), None, None) => Ok(OperatorCommand::Reset),
            (Some("stats"), None, None) => Ok(OperatorCommand::Stats),
            (Some("gaps"), None, None) => Ok(OperatorCommand::Gaps),
            (Some("q" | "quit"), None, None) => Ok(OperatorCommand::Quit),
            (Some("send"), Some(value), None) => value
                .parse()
                .map(OperatorCommand::Send)
                .map_err(|_| "Invalid count format. Use: send <number>".to_string()),
            _ => Err(format!("Unknown command: {}", s.trim())),
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCommand::Reset => write!(f, "reset"),
            OperatorCommand::Send(value) => write!(f, "send {}", value),
            OperatorCommand::Stats => write!(f, "stats"),
            OperatorCommand::Gaps => write!(f, "gaps"),
            OperatorCommand::Quit => write!(f, "quit"),
        }
    }
}

/// One-line help shown at startup
pub const HELP: &str =
    "Commands: 'reset' restarts at 0, 'send X' sends count X, 'stats', 'gaps', 'q' quits";

/// Read commands from stdin on a dedicated thread until EOF, `quit` or
/// shutdown. `quit` cancels the shutdown token; the other commands are
/// forwarded. The thread never holds up process exit.
pub fn spawn_console(commands: mpsc::Sender<OperatorCommand>, shutdown: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("operator-console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                if shutdown.is_cancelled() {
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to read operator console");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match line.parse::<OperatorCommand>() {
                    Ok(OperatorCommand::Quit) => {
                        info!("Quit requested from console");
                        shutdown.cancel();
                        break;
                    }
                    Ok(command) => {
                        if commands.blocking_send(command).is_err() {
                            break;
                        }
                    }
                    Err(message) => warn!(input = %line.trim(), "{}", message),
                }
            }
            debug!("Operator console closed");
        });

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start operator console");
    }
}
