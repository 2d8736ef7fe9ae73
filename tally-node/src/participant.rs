use crate::agent::ParticipantAgent;
use crate::codec::CountCodec;
use crate::config::TallyConfig;
use crate::error::{Result, TallyError};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::time::Duration;
use tally_common::{Message, WireFormat};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings of one participant process
#[derive(Debug, Clone)]
pub struct ParticipantSettings {
    pub id: u32,
    pub participants: u32,
    pub format: WireFormat,
    pub turn_delay: Duration,
    pub resend_interval: Duration,
    pub watchdog: Option<Duration>,
    pub announce: bool,
    pub startup_delay: Duration,
}

impl ParticipantSettings {
    /// `watchdog_default` is the topology default used when the config
    /// leaves the watchdog unset.
    pub fn from_config(config: &TallyConfig, watchdog_default: bool) -> Self {
        Self {
            id: config.participant.id,
            participants: config.protocol.participants,
            format: config.protocol.format,
            turn_delay: config.turn_delay(),
            resend_interval: config.resend_interval(),
            watchdog: config
                .watchdog_active(watchdog_default)
                .then(|| config.watchdog_timeout()),
            announce: config.participant.announce,
            startup_delay: Duration::from_millis(config.participant.startup_delay_ms),
        }
    }

    pub(crate) fn agent(&self) -> ParticipantAgent {
        let agent = ParticipantAgent::new(self.id, self.participants, self.resend_interval);
        match self.watchdog {
            Some(timeout) => agent.with_watchdog(timeout),
            None => agent,
        }
    }
}

/// What a participant did before it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParticipantSummary {
    pub sent: u64,
    pub observed: u64,
    pub last_expected: i64,
}

/// Connect to the coordinator. Failure here is a setup failure.
pub async fn connect(target: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| TallyError::setup(format!("connect {}", target), e))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    info!(coordinator = %target, "Connected to coordinator");
    Ok(stream)
}

/// Take turns over an established connection until it drops or shutdown is
/// requested. Losing the connection is not an error.
pub async fn run<T>(
    io: T,
    settings: ParticipantSettings,
    shutdown: CancellationToken,
) -> Result<ParticipantSummary>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, CountCodec::new(settings.format));
    let mut agent = settings.agent();
    let mut summary = ParticipantSummary::default();

    info!(
        id = settings.id,
        participants = settings.participants,
        watchdog = agent.has_watchdog(),
        "Participant started"
    );

    if settings.announce {
        framed
            .send(Message::Join(settings.id))
            .await
            .map_err(codec_error)?;
    }

    if !settings.startup_delay.is_zero() {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(summary),
            _ = tokio::time::sleep(settings.startup_delay) => {}
        }
    }

    let mut ticker = interval(settings.turn_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(id = settings.id, "Shutdown requested");
                break;
            }
            frame = framed.next() => match frame {
                Some(Ok(text)) => match Message::parse(&text) {
                    Ok(message) => {
                        summary.observed += 1;
                        agent.observe(message, Instant::now());
                    }
                    Err(e) => {
                        counter!("tally_messages_discarded_total", 1);
                        debug!(error = %e, "Discarding malformed message");
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    counter!("tally_messages_discarded_total", 1);
                    debug!("Discarding oversized message");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!(error = %e, "Connection to coordinator failed");
                    break;
                }
                None => {
                    warn!("Coordinator closed the connection");
                    break;
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                let next = agent
                    .check_watchdog(now)
                    .or_else(|| agent.next_contribution(now));
                let Some(value) = next else {
                    continue;
                };
                if let Err(e) = framed.send(Message::Count(value)).await {
                    warn!(error = %codec_error(e), "Failed to send contribution");
                    break;
                }
                summary.sent += 1;
                debug!(id = settings.id, value = value, "Sent contribution");
            }
        }
    }

    summary.last_expected = agent.local_expected();
    info!(
        id = settings.id,
        sent = summary.sent,
        observed = summary.observed,
        "Participant stopped"
    );
    Ok(summary)
}

fn codec_error(err: LinesCodecError) -> TallyError {
    match err {
        LinesCodecError::Io(e) => TallyError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => TallyError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn settings(id: u32, announce: bool) -> ParticipantSettings {
        ParticipantSettings {
            id,
            participants: 3,
            format: WireFormat::Line,
            turn_delay: Duration::from_millis(100),
            resend_interval: Duration::from_millis(1000),
            watchdog: None,
            announce,
            startup_delay: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_zero_opens_and_follows_broadcasts() {
        let (client, server) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(client, settings(0, true), shutdown.clone()));

        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("JOIN:0"));
        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("0"));

        write.write_all(b"0\n1\n2\n").await.expect("write");
        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("3"));

        shutdown.cancel();
        let summary = handle.await.expect("join").expect("run");
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.observed, 3);
        assert_eq!(summary.last_expected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_ends_cleanly() {
        let (client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(run(client, settings(1, false), CancellationToken::new()));

        drop(server);
        let summary = handle.await.expect("join").expect("run");
        assert_eq!(summary.sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_ignored() {
        let (client, server) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(client, settings(2, false), shutdown.clone()));

        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"banana\n1\n").await.expect("write");
        assert_eq!(lines.next_line().await.expect("read").as_deref(), Some("2"));

        shutdown.cancel();
        let summary = handle.await.expect("join").expect("run");
        assert_eq!(summary.observed, 1);
    }
}
