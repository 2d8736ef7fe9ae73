use crate::error::Result;
use crate::group::{parse_datagram, GroupTransport};
use crate::participant::{ParticipantSettings, ParticipantSummary};
use metrics::counter;
use tally_common::Message;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Take turns on a datagram group with no coordinator.
///
/// Every member hears every count, its own included. Participant 0 opens the
/// game by sending 0 and, with the watchdog armed, restarts it after a long
/// silence.
pub async fn run_peer<G>(
    group: &G,
    settings: ParticipantSettings,
    shutdown: CancellationToken,
) -> Result<ParticipantSummary>
where
    G: GroupTransport + ?Sized,
{
    let mut agent = settings.agent();
    let mut summary = ParticipantSummary::default();

    info!(
        id = settings.id,
        participants = settings.participants,
        group = %group.describe(),
        watchdog = agent.has_watchdog(),
        "Peer started"
    );

    if settings.announce {
        if let Err(e) = group.send_message(Message::Join(settings.id)).await {
            debug!(error = %e, "Join announcement not sent");
        }
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
            received = group.recv_text() => match received {
                Ok(text) => {
                    let now = Instant::now();
                    for parsed in parse_datagram(&text) {
                        match parsed {
                            Ok(message) => {
                                summary.observed += 1;
                                agent.observe(message, now);
                            }
                            Err(e) => {
                                counter!("tally_messages_discarded_total", 1);
                                debug!(error = %e, "Discarding malformed datagram");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Group receive failed");
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
                match group.send_message(Message::Count(value)).await {
                    Ok(()) => {
                        summary.sent += 1;
                        debug!(id = settings.id, value = value, "Sent count to group");
                    }
                    Err(e) => {
                        warn!(id = settings.id, value = value, error = %e, "Failed to send count");
                    }
                }
            }
        }
    }

    summary.last_expected = agent.local_expected();
    info!(
        id = settings.id,
        sent = summary.sent,
        observed = summary.observed,
        "Peer stopped"
    );
    Ok(summary)
}
