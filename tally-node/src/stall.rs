use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Observable detector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPhase {
    /// No participant registered, waiting for the first one
    Bootstrap,
    /// At least one participant registered
    Active,
}

/// What the current tick should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    Wait,
    Simulate,
}

/// Decides when a missing contribution has to be synthesized.
///
/// The decision only depends on the inputs of [`StallDetector::evaluate`],
/// so the periodic loop around it stays trivial.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: Duration,
    grace: Duration,
    started_at: Instant,
    simulate_when_empty: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration, grace: Duration) -> Self {
        Self::starting_at(threshold, grace, Instant::now())
    }

    pub fn starting_at(threshold: Duration, grace: Duration, started_at: Instant) -> Self {
        Self {
            threshold,
            grace,
            started_at,
            simulate_when_empty: false,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn phase(&self, registry_len: usize) -> StallPhase {
        if registry_len == 0 {
            StallPhase::Bootstrap
        } else {
            StallPhase::Active
        }
    }

    /// Whether the bootstrap grace period has run out with nobody joining
    pub fn simulating_when_empty(&self) -> bool {
        self.simulate_when_empty
    }

    pub fn evaluate(
        &mut self,
        now: Instant,
        last_update: Instant,
        registry_len: usize,
        ever_registered: bool,
    ) -> StallDecision {
        if self.phase(registry_len) == StallPhase::Bootstrap
            && !ever_registered
            && !self.simulate_when_empty
            && now.saturating_duration_since(self.started_at) > self.grace
        {
            info!(
                grace_secs = self.grace.as_secs(),
                "No participant joined within the grace period, simulating alone"
            );
            self.simulate_when_empty = true;
        }

        let elapsed = now.saturating_duration_since(last_update);
        if elapsed > self.threshold && (registry_len > 0 || self.simulate_when_empty) {
            StallDecision::Simulate
        } else {
            StallDecision::Wait
        }
    }
}
