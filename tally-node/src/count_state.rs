use metrics::{counter, gauge};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tally_common::turn_owner;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Authoritative shared counter.
///
/// `current_count` is the next expected value. Scalars are atomics; only the
/// timestamp of the last acceptance sits behind a mutex.
#[derive(Debug)]
pub struct CountState {
    participants: u32,
    current_count: AtomicI64,
    total_accepted: AtomicU64,
    last_update: Mutex<Instant>,
}

/// A value the state advanced past
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// The contributed (or synthesized) value
    pub value: i64,
    /// Produced by stall recovery rather than a participant
    pub synthetic: bool,
    /// Acceptance events since start, this one included
    pub total: u64,
}

/// Strict validation refused the contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Value the coordinator expects next
    pub expected: i64,
}

/// Point-in-time view of the counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSnapshot {
    pub current_count: i64,
    pub total_accepted: u64,
    pub since_update: Duration,
}

impl CountState {
    pub fn new(participants: u32) -> Self {
        Self {
            participants,
            current_count: AtomicI64::new(0),
            total_accepted: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Number of participants taking turns
    pub fn participants(&self) -> u32 {
        self.participants
    }

    /// Next expected value
    pub fn current(&self) -> i64 {
        self.current_count.load(Ordering::SeqCst)
    }

    /// Acceptance events since start
    pub fn total(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Participant whose turn it is
    pub fn expected_owner(&self) -> u32 {
        turn_owner(self.current(), self.participants)
    }

    /// Accept `received` unconditionally: the next expected value becomes
    /// `received + 1` even if that regresses the counter.
    pub fn observe(&self, received: i64) -> Accepted {
        let previous = self.current_count.swap(received.saturating_add(1), Ordering::SeqCst);
        if received != previous {
            debug!(
                received = received,
                expected = previous,
                "Accepted out-of-turn contribution"
            );
        }
        self.record_acceptance(received, false)
    }

    /// Accept `received` only if it is the expected value and `claimed_owner`
    /// owns that turn.
    pub fn observe_strict(
        &self,
        received: i64,
        claimed_owner: u32,
    ) -> std::result::Result<Accepted, Rejected> {
        if turn_owner(received, self.participants) != claimed_owner {
            counter!("tally_contributions_rejected_total", 1);
            return Err(Rejected {
                expected: self.current(),
            });
        }

        match self.current_count.compare_exchange(
            received,
            received.saturating_add(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(self.record_acceptance(received, false)),
            Err(expected) => {
                counter!("tally_contributions_rejected_total", 1);
                Err(Rejected { expected })
            }
        }
    }

    /// Advance on behalf of an unresponsive participant and return the
    /// pre-advance value.
    pub fn advance_by_simulation(&self) -> Accepted {
        let value = self.current_count.fetch_add(1, Ordering::SeqCst);
        self.record_acceptance(value, true)
    }

    /// Monotonic acceptance used where there is no authority: `received` only
    /// counts if it moves the counter forward.
    pub fn observe_if_newer(&self, received: i64) -> Option<Accepted> {
        let next = received.saturating_add(1);
        self.current_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (next > current).then_some(next)
            })
            .ok()
            .map(|_| self.record_acceptance(received, false))
    }

    /// Restart the count at 0. Lifetime totals are kept.
    pub fn reset(&self) {
        self.current_count.store(0, Ordering::SeqCst);
        self.touch();
        gauge!("tally_current_count", 0.0);
    }

    /// Restart the stall clock without accepting anything
    pub fn touch(&self) {
        *self.lock_last_update() = Instant::now();
    }

    /// Instant of the last acceptance (or touch)
    pub fn last_update(&self) -> Instant {
        *self.lock_last_update()
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            current_count: self.current(),
            total_accepted: self.total(),
            since_update: self.last_update().elapsed(),
        }
    }

    fn record_acceptance(&self, value: i64, synthetic: bool) -> Accepted {
        let total = self.total_accepted.fetch_add(1, Ordering::Relaxed) + 1;
        self.touch();

        if synthetic {
            counter!("tally_contributions_simulated_total", 1);
        } else {
            counter!("tally_contributions_accepted_total", 1);
        }
        gauge!("tally_current_count", value.saturating_add(1) as f64);

        Accepted {
            value,
            synthetic,
            total,
        }
    }

    fn lock_last_update(&self) -> std::sync::MutexGuard<'_, Instant> {
        match self.last_update.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Last update mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
