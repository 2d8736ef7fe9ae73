use crate::config::{ModeRule, TallyConfig, WindowPolicy};
use std::fmt;
use std::time::Duration;
use tally_common::turn_owner;
use tokio::time::Instant;

/// Console reporting granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// One line per accepted value
    #[default]
    Verbose,
    /// Timer-gated status line overwritten in place
    Fast,
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayMode::Verbose => write!(f, "verbose"),
            DisplayMode::Fast => write!(f, "fast"),
        }
    }
}

/// Thresholds and window policy for [`RateTracker`]
#[derive(Debug, Clone)]
pub struct RateSettings {
    pub participants: u32,
    pub rule: ModeRule,
    pub inter_arrival_threshold: Duration,
    pub throughput_threshold_per_ms: f64,
    pub fast_refresh: Duration,
    pub window_policy: WindowPolicy,
    pub min_window: Duration,
    pub window: Duration,
}

impl RateSettings {
    pub fn from_config(config: &TallyConfig) -> Self {
        let display = &config.display;
        Self {
            participants: config.protocol.participants,
            rule: display.rule,
            inter_arrival_threshold: Duration::from_millis(display.inter_arrival_threshold_ms),
            throughput_threshold_per_ms: display.throughput_threshold_per_ms,
            fast_refresh: Duration::from_millis(display.fast_refresh_ms),
            window_policy: display.window_policy,
            min_window: Duration::from_millis(display.min_window_ms),
            window: Duration::from_millis(display.window_ms),
        }
    }
}

/// Result of recording one acceptance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub mode: DisplayMode,
    /// Set when this acceptance switched the mode
    pub transition: Option<DisplayMode>,
    /// Whether the console should render this acceptance
    pub render: bool,
    pub inter_arrival: Option<Duration>,
    /// Accepted values per second over the current window
    pub window_rate: f64,
    /// Accepted values per second since start
    pub lifetime_rate: f64,
}

/// Throughput tracking and display mode switching.
///
/// Every acceptance re-evaluates the rule; there is no hysteresis band, so
/// the mode follows the rule's outcome on each event.
#[derive(Debug, Clone)]
pub struct RateTracker {
    settings: RateSettings,
    started_at: Instant,
    total: u64,
    window_start: Instant,
    window_count: u64,
    last_event: Option<Instant>,
    last_render: Option<Instant>,
    mode: DisplayMode,
}

impl RateTracker {
    pub fn new(settings: RateSettings) -> Self {
        Self::starting_at(settings, Instant::now())
    }

    pub fn starting_at(settings: RateSettings, now: Instant) -> Self {
        Self {
            settings,
            started_at: now,
            total: 0,
            window_start: now,
            window_count: 0,
            last_event: None,
            last_render: None,
            mode: DisplayMode::Verbose,
        }
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn window_count(&self) -> u64 {
        self.window_count
    }

    /// Record the acceptance of `value` at `now`
    pub fn record(&mut self, value: i64, now: Instant) -> RateSample {
        self.maybe_reset_window(value, now);
        self.total += 1;
        self.window_count += 1;

        let inter_arrival = self
            .last_event
            .map(|previous| now.saturating_duration_since(previous));
        self.last_event = Some(now);

        let fast = match self.settings.rule {
            ModeRule::InterArrival => {
                inter_arrival.is_some_and(|gap| gap < self.settings.inter_arrival_threshold)
            }
            ModeRule::Throughput => {
                self.window_per_ms(now) > self.settings.throughput_threshold_per_ms
            }
        };
        let mode = if fast {
            DisplayMode::Fast
        } else {
            DisplayMode::Verbose
        };

        let transition = (mode != self.mode).then_some(mode);
        self.mode = mode;

        let render = match mode {
            DisplayMode::Verbose => true,
            DisplayMode::Fast => {
                transition.is_some()
                    || self.last_render.map_or(true, |at| {
                        now.saturating_duration_since(at) >= self.settings.fast_refresh
                    })
            }
        };
        if render {
            self.last_render = Some(now);
        }

        RateSample {
            mode,
            transition,
            render,
            inter_arrival,
            window_rate: self.window_per_ms(now) * 1000.0,
            lifetime_rate: self.lifetime_rate(now),
        }
    }

    /// Accepted values per second since start
    pub fn lifetime_rate(&self, now: Instant) -> f64 {
        let secs = now.saturating_duration_since(self.started_at).as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }

    fn window_per_ms(&self, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(self.window_start).as_secs_f64() * 1000.0;
        self.window_count as f64 / elapsed_ms.max(1.0)
    }

    fn maybe_reset_window(&mut self, value: i64, now: Instant) {
        let age = now.saturating_duration_since(self.window_start);
        let reset = match self.settings.window_policy {
            WindowPolicy::RoundBoundary => {
                turn_owner(value, self.settings.participants) == 0
                    && age >= self.settings.min_window
            }
            WindowPolicy::Fixed => age >= self.settings.window,
        };
        if reset {
            self.window_start = now;
            self.window_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(rule: ModeRule) -> RateSettings {
        RateSettings {
            participants: 3,
            rule,
            inter_arrival_threshold: Duration::from_millis(100),
            throughput_threshold_per_ms: 5.0,
            fast_refresh: Duration::from_millis(500),
            window_policy: WindowPolicy::RoundBoundary,
            min_window: Duration::from_millis(2000),
            window: Duration::from_millis(1000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_alternating_gaps_toggle_every_time() {
        let start = Instant::now();
        let mut tracker = RateTracker::starting_at(settings(ModeRule::InterArrival), start);

        let first = tracker.record(0, start);
        assert_eq!(first.mode, DisplayMode::Verbose);
        assert_eq!(first.transition, None);

        let mut now = start;
        let mut value = 1;
        for _ in 0..5 {
            now += Duration::from_millis(50);
            let sample = tracker.record(value, now);
            assert_eq!(sample.mode, DisplayMode::Fast);
            assert_eq!(sample.transition, Some(DisplayMode::Fast));
            assert!(sample.render);
            value += 1;

            now += Duration::from_millis(150);
            let sample = tracker.record(value, now);
            assert_eq!(sample.mode, DisplayMode::Verbose);
            assert_eq!(sample.transition, Some(DisplayMode::Verbose));
            assert!(sample.render);
            value += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_at_threshold_stays_verbose() {
        let start = Instant::now();
        let mut tracker = RateTracker::starting_at(settings(ModeRule::InterArrival), start);
        tracker.record(0, start);
        let sample = tracker.record(1, start + Duration::from_millis(100));
        assert_eq!(sample.mode, DisplayMode::Verbose);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_mode_is_timer_gated() {
        let start = Instant::now();
        let mut tracker = RateTracker::starting_at(settings(ModeRule::InterArrival), start);
        tracker.record(0, start);

        let mut rendered = 0;
        let mut now = start;
        for value in 1..=100 {
            now += Duration::from_millis(10);
            let sample = tracker.record(value, now);
            assert_eq!(sample.mode, DisplayMode::Fast);
            if sample.render {
                rendered += 1;
            }
        }
        // Transition at 10ms, then refreshes at 510ms
        assert_eq!(rendered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_rule() {
        let start = Instant::now();
        let mut tracker = RateTracker::starting_at(settings(ModeRule::Throughput), start);

        // Ten acceptances inside the first millisecond exceed 5 per ms
        let mut last = None;
        for value in 0..10 {
            last = Some(tracker.record(value, start));
        }
        assert_eq!(last.map(|s| s.mode), Some(DisplayMode::Fast));

        // Slow trickle pulls the windowed rate back under the threshold
        let sample = tracker.record(10, start + Duration::from_millis(50));
        assert_eq!(sample.mode, DisplayMode::Verbose);
        assert_eq!(sample.transition, Some(DisplayMode::Verbose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_boundary_window_reset() {
        let start = Instant::now();
        let mut tracker = RateTracker::starting_at(settings(ModeRule::InterArrival), start);

        tracker.record(0, start);
        tracker.record(1, start + Duration::from_millis(500));
        // Round boundary before the minimum window age keeps counting
        tracker.record(3, start + Duration::from_millis(1000));
        assert_eq!(tracker.window_count(), 3);

        // Not a round boundary
        tracker.record(4, start + Duration::from_millis(2500));
        assert_eq!(tracker.window_count(), 4);

        tracker.record(6, start + Duration::from_millis(3000));
        assert_eq!(tracker.window_count(), 1);
        assert_eq!(tracker.total(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_reset() {
        let start = Instant::now();
        let mut policy = settings(ModeRule::InterArrival);
        policy.window_policy = WindowPolicy::Fixed;
        let mut tracker = RateTracker::starting_at(policy, start);

        tracker.record(0, start);
        tracker.record(1, start + Duration::from_millis(400));
        assert_eq!(tracker.window_count(), 2);
        tracker.record(2, start + Duration::from_millis(1000));
        assert_eq!(tracker.window_count(), 1);
    }
}
