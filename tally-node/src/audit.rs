use std::collections::BTreeMap;
use tracing::debug;

/// Classification of one observed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// First sighting, at or above everything seen so far
    Fresh,
    /// First sighting, below the highest value already seen
    OutOfOrder,
    /// Seen before
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditSummary {
    pub observed: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub lowest: Option<i64>,
    pub highest: Option<i64>,
    /// Values between `lowest` and `highest` never observed, saturating at
    /// `u64::MAX`
    pub missing: u64,
}

/// Tracks which counter values were observed.
///
/// Observed values are kept as maximal runs `start -> end` (inclusive), so
/// memory grows with the number of gaps, not with the number of values. A
/// monitor joining a group mid-sequence starts its first run wherever it
/// joins.
#[derive(Debug, Clone, Default)]
pub struct SequenceAudit {
    runs: BTreeMap<i64, i64>,
    highest: Option<i64>,
    distinct: u64,
    observed: u64,
    duplicates: u64,
    out_of_order: u64,
}

impl SequenceAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: i64) -> AuditEvent {
        self.observed += 1;

        if self.contains(value) {
            self.duplicates += 1;
            debug!(value = value, "Duplicate count observed");
            return AuditEvent::Duplicate;
        }
        self.insert(value);
        self.distinct += 1;

        match self.highest {
            Some(highest) if value < highest => {
                self.out_of_order += 1;
                debug!(value = value, highest = highest, "Out-of-order count observed");
                AuditEvent::OutOfOrder
            }
            _ => {
                self.highest = Some(value);
                AuditEvent::Fresh
            }
        }
    }

    fn contains(&self, value: i64) -> bool {
        self.runs
            .range(..=value)
            .next_back()
            .is_some_and(|(_, end)| *end >= value)
    }

    /// Add a value not yet covered, merging it with adjacent runs
    fn insert(&mut self, value: i64) {
        let start = value
            .checked_sub(1)
            .and_then(|prev| {
                self.runs
                    .range(..=prev)
                    .next_back()
                    .filter(|(_, end)| **end == prev)
                    .map(|(start, _)| *start)
            })
            .unwrap_or(value);
        let end = value
            .checked_add(1)
            .and_then(|next| self.runs.remove(&next))
            .unwrap_or(value);
        self.runs.insert(start, end);
    }

    /// First `limit` values between the lowest and highest observed that
    /// were never observed
    pub fn gaps(&self, limit: usize) -> Vec<i64> {
        let mut gaps = Vec::new();
        let mut runs = self.runs.iter().peekable();
        while let Some((_, end)) = runs.next() {
            let Some((next_start, _)) = runs.peek() else {
                break;
            };
            // A following run exists, so `end + 1` cannot overflow
            for value in (*end + 1)..**next_start {
                if gaps.len() == limit {
                    return gaps;
                }
                gaps.push(value);
            }
        }
        gaps
    }

    pub fn summary(&self) -> AuditSummary {
        let lowest = self.runs.keys().next().copied();
        let missing = match (lowest, self.highest) {
            (Some(lowest), Some(highest)) => {
                let span = i128::from(highest) - i128::from(lowest) + 1;
                let missing = span - i128::from(self.distinct);
                u64::try_from(missing).unwrap_or(u64::MAX)
            }
            _ => 0,
        };
        AuditSummary {
            observed: self.observed,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            lowest,
            highest: self.highest,
            missing,
        }
    }

    /// Forget everything, used when the count restarts at 0
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of gaps currently tracked. Contiguous sequences keep it at 0.
    pub fn sparse_len(&self) -> usize {
        self.runs.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_contiguous_sequence_compacts() {
        let mut audit = SequenceAudit::new();
        for value in 0..1000 {
            assert_eq!(audit.record(value), AuditEvent::Fresh);
        }
        assert_eq!(audit.sparse_len(), 0);
        assert_eq!(audit.summary().missing, 0);
        assert!(audit.gaps(10).is_empty());
    }

    #[test]
    fn test_duplicates_and_out_of_order() {
        let mut audit = SequenceAudit::new();
        assert_eq!(audit.record(0), AuditEvent::Fresh);
        assert_eq!(audit.record(2), AuditEvent::Fresh);
        assert_eq!(audit.record(0), AuditEvent::Duplicate);
        assert_eq!(audit.record(2), AuditEvent::Duplicate);
        assert_eq!(audit.record(1), AuditEvent::OutOfOrder);

        let summary = audit.summary();
        assert_eq!(summary.observed, 5);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.out_of_order, 1);
        assert_eq!(summary.highest, Some(2));
        assert_eq!(summary.missing, 0);
        assert_eq!(audit.sparse_len(), 0);
    }

    #[test]
    fn test_gaps_are_reported_in_order() {
        let mut audit = SequenceAudit::new();
        for value in [0, 1, 4, 5, 9] {
            audit.record(value);
        }
        assert_eq!(audit.gaps(10), vec![2, 3, 6, 7, 8]);
        assert_eq!(audit.gaps(2), vec![2, 3]);
        assert_eq!(audit.summary().missing, 5);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut audit = SequenceAudit::new();
        audit.record(0);
        audit.record(1);
        audit.reset();
        assert_eq!(audit.record(0), AuditEvent::Fresh);
        assert_eq!(audit.summary().observed, 1);
    }

    #[test]
    fn test_contiguous_run_joined_mid_sequence_stays_compact() {
        let mut audit = SequenceAudit::new();
        for value in 500..100_500 {
            assert_eq!(audit.record(value), AuditEvent::Fresh);
        }
        assert_eq!(audit.sparse_len(), 0);

        let summary = audit.summary();
        assert_eq!(summary.lowest, Some(500));
        assert_eq!(summary.highest, Some(100_499));
        assert_eq!(summary.missing, 0);
    }

    #[test]
    fn test_late_value_below_first_observed_fills_in() {
        let mut audit = SequenceAudit::new();
        audit.record(10);
        audit.record(11);
        assert_eq!(audit.record(8), AuditEvent::OutOfOrder);
        assert_eq!(audit.gaps(10), vec![9]);
        assert_eq!(audit.sparse_len(), 1);

        assert_eq!(audit.record(9), AuditEvent::OutOfOrder);
        assert_eq!(audit.sparse_len(), 0);
        assert_eq!(audit.summary().missing, 0);
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let mut audit = SequenceAudit::new();
        assert_eq!(audit.record(i64::MAX), AuditEvent::Fresh);
        assert_eq!(audit.record(i64::MAX), AuditEvent::Duplicate);
        assert_eq!(audit.summary().missing, 0);

        audit.record(i64::MIN);
        let summary = audit.summary();
        assert_eq!(summary.missing, u64::MAX - 1);
        assert_eq!(audit.gaps(2), vec![i64::MIN + 1, i64::MIN + 2]);

        audit.record(0);
        assert_eq!(audit.sparse_len(), 2);
    }

    proptest! {
        #[test]
        fn test_missing_matches_gaps(values in proptest::collection::vec(0i64..200, 0..100)) {
            let mut audit = SequenceAudit::new();
            for value in &values {
                audit.record(*value);
            }
            let summary = audit.summary();
            prop_assert_eq!(summary.missing as usize, audit.gaps(usize::MAX).len());
            prop_assert_eq!(summary.observed as usize, values.len());
        }
    }
}
