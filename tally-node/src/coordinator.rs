use crate::broadcaster::Broadcaster;
use crate::config::{TallyConfig, ValidationMode};
use crate::count_state::{Accepted, CountSnapshot, CountState, Rejected};
use crate::operator::OperatorCommand;
use crate::rate::{RateSettings, RateTracker};
use crate::registry::{ParticipantKey, ParticipantRegistry};
use crate::reporter::Reporter;
use crate::stall::{StallDecision, StallDetector};
use crate::transport::ParticipantLink;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_common::{turn_owner, Message};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted(Accepted),
    /// Strict validation refused it; the sender was told what to send
    Rejected(Rejected),
    /// The sender announced its id
    Identified(u32),
    /// Not something participants are expected to send
    Ignored,
}

/// Holds the authoritative count and drives acceptance, fan-out, stall
/// recovery and the console display.
pub struct Coordinator {
    participants: u32,
    validation: ValidationMode,
    state: Arc<CountState>,
    registry: Arc<ParticipantRegistry>,
    broadcaster: Broadcaster,
    rate: Mutex<RateTracker>,
    reporter: Arc<Reporter>,
    stall_enabled: bool,
    stall_tick: Duration,
    stall_threshold: Duration,
    bootstrap_grace: Duration,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: &TallyConfig, reporter: Arc<Reporter>, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(ParticipantRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone(), config.protocol.format);

        info!(
            participants = config.protocol.participants,
            validation = ?config.protocol.validation,
            format = %config.protocol.format,
            stall_threshold_ms = config.stall.threshold_ms,
            "Coordinator configured"
        );

        Self {
            participants: config.protocol.participants,
            validation: config.protocol.validation,
            state: Arc::new(CountState::new(config.protocol.participants)),
            registry,
            broadcaster,
            rate: Mutex::new(RateTracker::new(RateSettings::from_config(config))),
            reporter,
            stall_enabled: config.stall.enabled,
            stall_tick: config.stall_tick(),
            stall_threshold: config.stall_threshold(),
            bootstrap_grace: config.bootstrap_grace(),
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<CountState> {
        self.state.clone()
    }

    pub fn registry(&self) -> Arc<ParticipantRegistry> {
        self.registry.clone()
    }

    pub fn reporter(&self) -> Arc<Reporter> {
        self.reporter.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn snapshot(&self) -> CountSnapshot {
        self.state.snapshot()
    }

    pub async fn register(&self, link: Box<dyn ParticipantLink>) -> ParticipantKey {
        self.registry.register(link).await
    }

    pub async fn disconnect(&self, key: ParticipantKey) {
        if self.registry.remove(key).await {
            debug!(participant = key, remaining = self.registry.len(), "Participant disconnected");
        }
    }

    /// Apply one message received from participant `key`
    pub async fn handle_message(&self, key: ParticipantKey, message: Message) -> Outcome {
        match message {
            Message::Join(id) => {
                if id >= self.participants {
                    warn!(participant = key, id, "Announced id is out of range, ignoring");
                    return Outcome::Ignored;
                }
                match self.registry.set_identity(key, id).await {
                    Ok(()) => Outcome::Identified(id),
                    Err(e) => {
                        debug!(participant = key, error = %e, "Join from unregistered participant");
                        Outcome::Ignored
                    }
                }
            }
            Message::Count(value) => self.contribute(key, value).await,
            Message::Accepted(_) | Message::InvalidCount(_) => {
                debug!(participant = key, ?message, "Ignoring coordinator-only message");
                Outcome::Ignored
            }
        }
    }

    async fn contribute(&self, key: ParticipantKey, value: i64) -> Outcome {
        let accepted = match self.validation {
            ValidationMode::Permissive => self.state.observe(value),
            ValidationMode::Strict => {
                let Some(owner) = self.registry.claimed_owner(key, self.participants).await else {
                    return Outcome::Ignored;
                };
                match self.state.observe_strict(value, owner) {
                    Ok(accepted) => accepted,
                    Err(rejected) => {
                        debug!(
                            participant = key,
                            received = value,
                            expected = rejected.expected,
                            "Rejected contribution"
                        );
                        if let Err(e) = self
                            .broadcaster
                            .send_to(key, Message::InvalidCount(rejected.expected))
                            .await
                        {
                            debug!(participant = key, error = %e, "Correction not delivered");
                        }
                        return Outcome::Rejected(rejected);
                    }
                }
            }
        };

        self.publish(accepted).await;
        Outcome::Accepted(accepted)
    }

    /// Advance on behalf of whoever owns the current turn
    pub async fn simulate(&self) -> Accepted {
        let accepted = self.state.advance_by_simulation();
        info!(
            value = accepted.value,
            participant = turn_owner(accepted.value, self.participants),
            "Simulated contribution"
        );
        self.publish(accepted).await;
        accepted
    }

    /// Operator injected value, accepted without validation
    pub async fn inject(&self, value: i64) -> Accepted {
        let accepted = self.state.observe(value);
        info!(value = value, "Operator sent count");
        self.publish(accepted).await;
        accepted
    }

    /// Restart the count at 0. The next stall recovery or contribution of 0
    /// resynchronizes everyone.
    pub fn reset(&self) {
        self.state.reset();
        info!("Count reset to 0");
        self.reporter.notice("Count reset to 0");
    }

    async fn publish(&self, accepted: Accepted) {
        let sample = self.lock_rate().record(accepted.value, Instant::now());
        self.reporter.accepted(
            accepted.value,
            turn_owner(accepted.value, self.participants),
            accepted.synthetic,
            &sample,
        );
        self.broadcaster.broadcast_value(accepted.value).await;
    }

    /// One detector tick: simulate if the detector says so
    pub async fn stall_tick(&self, detector: &mut StallDetector) -> Option<Accepted> {
        let decision = detector.evaluate(
            Instant::now(),
            self.state.last_update(),
            self.registry.len(),
            self.registry.ever_registered(),
        );
        match decision {
            StallDecision::Simulate => Some(self.simulate().await),
            StallDecision::Wait => None,
        }
    }

    /// Periodic stall detection until shutdown
    pub async fn run_stall_loop(self: Arc<Self>) {
        if !self.stall_enabled {
            info!("Stall detection disabled");
            return;
        }

        let mut detector = StallDetector::new(self.stall_threshold, self.bootstrap_grace);
        let mut ticker = interval(self.stall_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.stall_tick.as_millis() as u64,
            threshold_ms = self.stall_threshold.as_millis() as u64,
            "Stall detector started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.stall_tick(&mut detector).await;
                }
            }
        }

        debug!("Stall detector stopped");
    }

    /// Apply console commands until shutdown or the console goes away
    pub async fn run_operator_commands(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<OperatorCommand>,
    ) {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                OperatorCommand::Reset => self.reset(),
                OperatorCommand::Send(value) => {
                    self.inject(value).await;
                }
                OperatorCommand::Stats => self.report_statistics(),
                OperatorCommand::Gaps => {
                    // Every value passes through here, so there is nothing to audit
                    self.reporter.notice("Gap analysis is only kept by the monitor");
                }
                OperatorCommand::Quit => self.shutdown.cancel(),
            }
        }
    }

    /// Print lifetime totals on request
    pub fn report_statistics(&self) {
        let snapshot = self.snapshot();
        let rate = self.lock_rate().lifetime_rate(Instant::now());
        self.reporter
            .totals(snapshot.total_accepted, snapshot.current_count, rate);
    }

    fn lock_rate(&self) -> std::sync::MutexGuard<'_, RateTracker> {
        match self.rate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Rate tracker mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
