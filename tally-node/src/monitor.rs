use crate::audit::{AuditEvent, AuditSummary, SequenceAudit};
use crate::config::TallyConfig;
use crate::count_state::{Accepted, CountState};
use crate::error::Result;
use crate::group::{parse_datagram, GroupTransport};
use crate::operator::OperatorCommand;
use crate::rate::{DisplayMode, RateSettings, RateTracker};
use crate::reporter::Reporter;
use metrics::counter;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{turn_owner, Message};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of missing values listed in the final audit report
const REPORTED_GAPS: usize = 10;

/// Number of missing values listed in periodic and on-demand gap reports
const PERIODIC_GAPS: usize = 5;

/// What the monitor does when the group goes quiet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// Print who the group is waiting for
    #[default]
    Observe,
    /// Send the missing count on the silent participant's behalf
    Simulate,
}

impl FromStr for MonitorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "observe" => Ok(MonitorMode::Observe),
            "simulate" => Ok(MonitorMode::Simulate),
            other => Err(format!(
                "unknown monitor mode '{}', expected 'observe' or 'simulate'",
                other
            )),
        }
    }
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorMode::Observe => write!(f, "observe"),
            MonitorMode::Simulate => write!(f, "simulate"),
        }
    }
}

/// Result of a stall check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Notice printed, nothing sent
    Waiting { expected: i64, owner: u32 },
    /// This count has to be sent to the group
    Simulate(Accepted),
}

/// Passive observer of a datagram group: progress display, sequence audit
/// and optional stall recovery.
pub struct Monitor {
    participants: u32,
    mode: MonitorMode,
    stall_threshold: Duration,
    gap_report: Option<Duration>,
    state: Arc<CountState>,
    rate: RateTracker,
    rate_settings: RateSettings,
    audit: SequenceAudit,
    reporter: Arc<Reporter>,
}

impl Monitor {
    pub fn new(config: &TallyConfig, mode: MonitorMode, reporter: Arc<Reporter>) -> Self {
        let rate_settings = RateSettings::from_config(config);
        Self {
            participants: config.protocol.participants,
            mode,
            stall_threshold: config.stall_threshold(),
            gap_report: config.gap_report_interval(),
            state: Arc::new(CountState::new(config.protocol.participants)),
            rate: RateTracker::new(rate_settings.clone()),
            rate_settings,
            audit: SequenceAudit::new(),
            reporter,
        }
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    /// Next value the group should produce
    pub fn current(&self) -> i64 {
        self.state.current()
    }

    pub fn audit(&self) -> &SequenceAudit {
        &self.audit
    }

    /// Shared count, for the statistics loop
    pub fn state(&self) -> Arc<CountState> {
        self.state.clone()
    }

    /// Period of the gap analysis report, if enabled
    pub fn gap_report_interval(&self) -> Option<Duration> {
        self.gap_report
    }

    /// Process one message heard on the group
    pub fn handle(&mut self, message: Message, now: Instant) -> Option<Accepted> {
        let value = match message {
            Message::Count(value) | Message::Accepted(value) => value,
            Message::Join(id) => {
                info!(id, "Participant announced itself");
                return None;
            }
            Message::InvalidCount(_) => return None,
        };

        if self.audit.record(value) == AuditEvent::Duplicate {
            return None;
        }

        let accepted = self.state.observe_if_newer(value)?;
        let sample = self.rate.record(value, now);
        self.reporter.accepted(
            value,
            turn_owner(value, self.participants),
            false,
            &sample,
        );
        Some(accepted)
    }

    /// Act on silence longer than the stall threshold
    pub fn check_stall(&mut self, now: Instant) -> Option<StallAction> {
        if now.saturating_duration_since(self.state.last_update()) <= self.stall_threshold {
            return None;
        }

        let expected = self.state.current();
        let owner = turn_owner(expected, self.participants);
        match self.mode {
            MonitorMode::Observe => {
                self.state.touch();
                info!(expected, participant = owner, "Group is stalled");
                self.reporter.notice(&format!(
                    "Waiting for count {} from participant {}...",
                    expected, owner
                ));
                Some(StallAction::Waiting { expected, owner })
            }
            MonitorMode::Simulate => {
                let accepted = self.state.advance_by_simulation();
                let sample = self.rate.record(accepted.value, now);
                self.reporter.accepted(accepted.value, owner, true, &sample);
                Some(StallAction::Simulate(accepted))
            }
        }
    }

    /// Forget the count, the audit trail and the rate history
    pub fn reset(&mut self) {
        self.state.reset();
        self.audit.reset();
        self.rate = RateTracker::new(self.rate_settings.clone());
        info!("Count reset to 0");
        self.reporter.notice("Count reset to 0");
    }

    pub fn summary(&self) -> AuditSummary {
        self.audit.summary()
    }

    /// Print the audit totals and the first few gaps
    pub fn report_gaps(&self) -> AuditSummary {
        let summary = self.audit.summary();
        let gaps = self.audit.gaps(PERIODIC_GAPS);
        info!(
            observed = summary.observed,
            missing = summary.missing,
            duplicates = summary.duplicates,
            out_of_order = summary.out_of_order,
            first_gaps = ?gaps,
            "Gap analysis"
        );

        let mut text = format!(
            "Gap analysis: {} observed, {} missing, {} duplicates, {} out of order",
            summary.observed, summary.missing, summary.duplicates, summary.out_of_order
        );
        if !gaps.is_empty() {
            let listed: Vec<String> = gaps.iter().map(|value| value.to_string()).collect();
            text.push_str(&format!("; first gaps: {}", listed.join(", ")));
            if summary.missing > gaps.len() as u64 {
                text.push_str(" ...");
            }
        }
        self.reporter.notice(&text);
        summary
    }

    /// Print lifetime totals on request
    pub fn report_statistics(&self, now: Instant) {
        self.reporter.totals(
            self.state.total(),
            self.state.current(),
            self.rate.lifetime_rate(now),
        );
    }

    /// Periodic reports stay quiet while the display is in fast mode
    pub fn in_fast_mode(&self) -> bool {
        self.rate.mode() == DisplayMode::Fast
    }
}

/// Drive a monitor on `group` until shutdown
pub async fn run_monitor<G>(
    group: &G,
    monitor: &mut Monitor,
    tick: Duration,
    mut commands: Option<mpsc::Receiver<OperatorCommand>>,
    shutdown: CancellationToken,
) -> Result<AuditSummary>
where
    G: GroupTransport + ?Sized,
{
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gap_ticker = monitor.gap_report_interval().map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    if let Some(ticker) = gap_ticker.as_mut() {
        // First tick completes immediately
        ticker.tick().await;
    }

    info!(group = %group.describe(), mode = %monitor.mode(), "Monitor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = group.recv_text() => match received {
                Ok(text) => {
                    let now = Instant::now();
                    for parsed in parse_datagram(&text) {
                        match parsed {
                            Ok(message) => {
                                monitor.handle(message, now);
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
                if let Some(StallAction::Simulate(accepted)) = monitor.check_stall(Instant::now()) {
                    info!(value = accepted.value, "Simulated count");
                    if let Err(e) = group.send_message(Message::Count(accepted.value)).await {
                        warn!(value = accepted.value, error = %e, "Failed to send simulated count");
                    }
                }
            }
            _ = next_tick(&mut gap_ticker) => {
                if !monitor.in_fast_mode() {
                    monitor.report_gaps();
                }
            }
            Some(command) = recv_command(&mut commands) => match command {
                OperatorCommand::Reset => monitor.reset(),
                OperatorCommand::Stats => monitor.report_statistics(Instant::now()),
                OperatorCommand::Gaps => {
                    monitor.report_gaps();
                }
                OperatorCommand::Send(value) => {
                    info!(value, "Operator sent count");
                    if let Err(e) = group.send_message(Message::Count(value)).await {
                        warn!(value, error = %e, "Failed to send count");
                    }
                }
                OperatorCommand::Quit => shutdown.cancel(),
            },
        }
    }

    let summary = monitor.summary();
    let gaps = monitor.audit().gaps(REPORTED_GAPS);
    info!(
        observed = summary.observed,
        duplicates = summary.duplicates,
        out_of_order = summary.out_of_order,
        missing = summary.missing,
        first_gaps = ?gaps,
        "Monitor stopped"
    );
    Ok(summary)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_command(
    commands: &mut Option<mpsc::Receiver<OperatorCommand>>,
) -> Option<OperatorCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LoopbackGroup;
    use crate::reporter::test_support::SharedBuffer;
    use tally_common::WireFormat;

    fn monitor(mode: MonitorMode) -> (Monitor, SharedBuffer) {
        let mut config = TallyConfig::default();
        config.protocol.participants = 3;
        let buffer = SharedBuffer::default();
        let reporter = Arc::new(Reporter::with_writer(true, Box::new(buffer.clone())));
        (Monitor::new(&config, mode, reporter), buffer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_follows_counts_monotonically() {
        let (mut monitor, buffer) = monitor(MonitorMode::Observe);
        let start = Instant::now();
        let at = |step: u64| start + Duration::from_millis(200 * step);

        assert!(monitor.handle(Message::Count(0), at(0)).is_some());
        assert!(monitor.handle(Message::Count(1), at(1)).is_some());
        assert!(monitor.handle(Message::Count(1), at(2)).is_none());
        assert!(monitor.handle(Message::Count(5), at(3)).is_some());
        assert!(monitor.handle(Message::Count(3), at(4)).is_none());
        assert_eq!(monitor.current(), 6);

        let summary = monitor.summary();
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.out_of_order, 1);
        assert_eq!(monitor.audit().gaps(10), vec![2, 4]);
        assert!(buffer.contents().contains("Count 5 from participant 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_mode_prints_waiting_notice_once_per_threshold() {
        let (mut monitor, buffer) = monitor(MonitorMode::Observe);
        let start = Instant::now();
        monitor.handle(Message::Count(0), start);

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(
            monitor.check_stall(Instant::now()),
            Some(StallAction::Waiting { expected: 1, owner: 1 })
        );
        assert!(monitor.check_stall(Instant::now()).is_none());
        assert!(buffer
            .contents()
            .contains("Waiting for count 1 from participant 1..."));
        assert_eq!(monitor.current(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_mode_sends_missing_count() {
        let (mut monitor, _buffer) = monitor(MonitorMode::Simulate);
        let group = LoopbackGroup::new(WireFormat::Line);
        let own = group.member();
        let observer = group.member();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let summary =
                run_monitor(&own, &mut monitor, Duration::from_millis(500), None, token).await;
            (summary, monitor.current())
        });

        // Nobody counts: after the threshold the monitor sends 0 itself
        assert_eq!(observer.recv_text().await.expect("recv"), "0\n");
        assert_eq!(observer.recv_text().await.expect("recv"), "1\n");

        shutdown.cancel();
        let (summary, current) = handle.await.expect("join");
        let summary = summary.expect("monitor");
        assert_eq!(current, 2);
        assert!(summary.observed >= 1);
        assert_eq!(summary.duplicates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_history() {
        let (mut monitor, _buffer) = monitor(MonitorMode::Observe);
        let now = Instant::now();
        monitor.handle(Message::Count(0), now);
        monitor.handle(Message::Count(1), now);
        monitor.reset();

        assert_eq!(monitor.current(), 0);
        assert!(monitor.handle(Message::Count(0), now).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_largest_count_does_not_break_the_audit() {
        let (mut monitor, _buffer) = monitor(MonitorMode::Observe);
        let group = LoopbackGroup::new(WireFormat::Line);
        let own = group.member();
        let sender = group.member();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            run_monitor(&own, &mut monitor, Duration::from_millis(500), None, token).await
        });

        sender
            .send_message(Message::Count(i64::MAX))
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();
        let summary = handle.await.expect("monitor task").expect("monitor");
        assert_eq!(summary.observed, 1);
        assert_eq!(summary.highest, Some(i64::MAX));
        assert_eq!(summary.missing, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_report_is_periodic_outside_fast_mode() {
        let (mut monitor, buffer) = monitor(MonitorMode::Observe);
        assert_eq!(monitor.gap_report_interval(), Some(Duration::from_secs(5)));
        let group = LoopbackGroup::new(WireFormat::Line);
        let own = group.member();
        let sender = group.member();
        let shutdown = CancellationToken::new();
        let (commands, rx) = mpsc::channel(4);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            run_monitor(&own, &mut monitor, Duration::from_millis(500), Some(rx), token).await
        });

        for value in [0, 1, 4] {
            sender.send_message(Message::Count(value)).await.expect("send");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let report = "Gap analysis: 3 observed, 2 missing, 0 duplicates, 0 out of order; \
                      first gaps: 2, 3";
        assert!(buffer.contents().contains(report));

        // Back-to-back counts switch the display to fast mode
        sender.send_message(Message::Count(5)).await.expect("send");
        sender.send_message(Message::Count(6)).await.expect("send");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(buffer.contents().matches("Gap analysis").count(), 1);

        // On demand it is printed whatever the mode
        commands.send(OperatorCommand::Gaps).await.expect("command");
        commands.send(OperatorCommand::Stats).await.expect("command");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = buffer.contents();
        assert_eq!(contents.matches("Gap analysis").count(), 2);
        assert!(contents.contains("Statistics: 5 accepted, current count 7"));

        shutdown.cancel();
        let summary = handle.await.expect("monitor task").expect("monitor");
        assert_eq!(summary.missing, 2);
    }

    #[test]
    fn test_monitor_mode_from_str() {
        assert_eq!("Simulate".parse(), Ok(MonitorMode::Simulate));
        assert!("passive".parse::<MonitorMode>().is_err());
    }
}
