use std::time::Duration;
use tally_common::{turn_owner, Message};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client-side turn logic, free of any I/O.
///
/// The runtime feeds it every message it receives and asks it, on each idle
/// tick, whether something has to be sent.
#[derive(Debug, Clone)]
pub struct ParticipantAgent {
    id: u32,
    participants: u32,
    local_expected: i64,
    last_observed: Instant,
    last_sent: Option<(i64, Instant)>,
    resend_interval: Duration,
    watchdog: Option<Duration>,
}

impl ParticipantAgent {
    pub fn new(id: u32, participants: u32, resend_interval: Duration) -> Self {
        Self {
            id,
            participants,
            local_expected: 0,
            last_observed: Instant::now(),
            last_sent: None,
            resend_interval,
            watchdog: None,
        }
    }

    /// Arm the watchdog. Only participant 0 ever runs one.
    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        if self.id == 0 {
            self.watchdog = Some(timeout);
        } else {
            warn!(id = self.id, "Watchdog requested for a participant other than 0, ignoring");
        }
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn local_expected(&self) -> i64 {
        self.local_expected
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Resynchronize from an inbound message. Returns true if the local
    /// expectation changed.
    pub fn observe(&mut self, message: Message, now: Instant) -> bool {
        let expected = match message {
            Message::Accepted(value) | Message::Count(value) => value.saturating_add(1),
            Message::InvalidCount(expected) => {
                debug!(id = self.id, expected, "Coordinator corrected our expectation");
                expected
            }
            Message::Join(_) => return false,
        };

        self.last_observed = now;
        let changed = expected != self.local_expected;
        self.local_expected = expected;
        changed
    }

    pub fn is_my_turn(&self) -> bool {
        turn_owner(self.local_expected, self.participants) == self.id
    }

    /// Value to contribute now, if any. A value already sent is only sent
    /// again once the resend interval passed without progress.
    pub fn next_contribution(&mut self, now: Instant) -> Option<i64> {
        if !self.is_my_turn() {
            return None;
        }

        if let Some((value, at)) = self.last_sent {
            if value == self.local_expected
                && now.saturating_duration_since(at) < self.resend_interval
            {
                return None;
            }
        }

        self.last_sent = Some((self.local_expected, now));
        Some(self.local_expected)
    }

    /// Watchdog check: after too long without any broadcast, restart the
    /// count at 0 and return the value to send.
    pub fn check_watchdog(&mut self, now: Instant) -> Option<i64> {
        let timeout = self.watchdog?;
        if now.saturating_duration_since(self.last_observed) <= timeout {
            return None;
        }

        info!(
            id = self.id,
            silent_ms = now.saturating_duration_since(self.last_observed).as_millis() as u64,
            "No count observed within the watchdog timeout, restarting at 0"
        );
        self.local_expected = 0;
        self.last_observed = now;
        self.last_sent = Some((0, now));
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEND: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_turn_follows_broadcast() {
        let now = Instant::now();
        let mut agent = ParticipantAgent::new(0, 3, RESEND);
        assert!(agent.is_my_turn());

        agent.observe(Message::Accepted(0), now);
        assert_eq!(agent.local_expected(), 1);
        assert!(!agent.is_my_turn());
        assert_eq!(agent.next_contribution(now), None);

        // N=3: after "2" participant 0 owns 3
        agent.observe(Message::Accepted(2), now);
        assert_eq!(agent.next_contribution(now), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_resyncs_to_next_broadcast() {
        let now = Instant::now();
        let mut agent = ParticipantAgent::new(1, 3, RESEND);
        assert_eq!(agent.local_expected(), 0);

        assert!(agent.observe(Message::Accepted(41), now));
        assert_eq!(agent.local_expected(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correction_sets_expectation() {
        let now = Instant::now();
        let mut agent = ParticipantAgent::new(2, 3, RESEND);
        agent.observe(Message::InvalidCount(5), now);
        assert_eq!(agent.local_expected(), 5);
        assert_eq!(agent.next_contribution(now), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_waits_for_interval() {
        let start = Instant::now();
        let mut agent = ParticipantAgent::new(0, 2, RESEND);

        assert_eq!(agent.next_contribution(start), Some(0));
        assert_eq!(agent.next_contribution(start + Duration::from_millis(100)), None);
        assert_eq!(agent.next_contribution(start + Duration::from_millis(999)), None);
        assert_eq!(agent.next_contribution(start + Duration::from_millis(1000)), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restarts_at_zero() {
        let start = Instant::now();
        let mut agent = ParticipantAgent::new(0, 3, RESEND).with_watchdog(Duration::from_secs(8));
        agent.observe(Message::Accepted(10), start);

        assert_eq!(agent.check_watchdog(start + Duration::from_secs(8)), None);
        assert_eq!(agent.check_watchdog(start + Duration::from_millis(8001)), Some(0));
        assert_eq!(agent.local_expected(), 0);
        // Fresh timeout after firing
        assert_eq!(agent.check_watchdog(start + Duration::from_secs(9)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_only_for_participant_zero() {
        let agent = ParticipantAgent::new(1, 3, RESEND).with_watchdog(Duration::from_secs(8));
        assert!(!agent.has_watchdog());
    }
}
