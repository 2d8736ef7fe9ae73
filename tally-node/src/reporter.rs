use crate::count_state::CountState;
use crate::rate::{DisplayMode, RateSample};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Console {
    out: Box<dyn Write + Send>,
    /// A fast-mode status line is on screen without a trailing newline
    in_place: bool,
    mode: DisplayMode,
}

/// Progress display on stdout, separate from the tracing logs
pub struct Reporter {
    enabled: bool,
    console: Mutex<Console>,
}

impl Reporter {
    /// Reporter writing to stdout
    pub fn stdout(enabled: bool) -> Self {
        Self::with_writer(enabled, Box::new(io::stdout()))
    }

    pub fn with_writer(enabled: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            enabled,
            console: Mutex::new(Console {
                out,
                in_place: false,
                mode: DisplayMode::Verbose,
            }),
        }
    }

    /// Mode of the most recent render
    pub fn mode(&self) -> DisplayMode {
        self.lock_console().mode
    }

    /// Render one accepted value according to the tracker's verdict
    pub fn accepted(&self, value: i64, owner: u32, synthetic: bool, sample: &RateSample) {
        if let Some(mode) = sample.transition {
            info!(
                mode = %mode,
                rate = sample.window_rate,
                "Display mode changed"
            );
        }

        let mut console = self.lock_console();
        console.mode = sample.mode;
        if !self.enabled || !sample.render {
            return;
        }

        let result = match sample.mode {
            DisplayMode::Verbose => {
                let prefix = if console.in_place { "\n" } else { "" };
                console.in_place = false;
                let source = if synthetic { "simulated for" } else { "from" };
                writeln!(
                    console.out,
                    "{}Count {} {} participant {} (Rate: {:.1} counts/sec)",
                    prefix, value, source, owner, sample.window_rate
                )
            }
            DisplayMode::Fast => {
                console.in_place = true;
                write!(
                    console.out,
                    "\rCurrent count: {} | Rate: {:.1} counts/sec | Overall: {:.1} counts/sec   ",
                    value, sample.window_rate, sample.lifetime_rate
                )
            }
        };

        if let Err(e) = result.and_then(|_| console.out.flush()) {
            debug!(error = %e, "Console write failed");
        }
    }

    /// Print a standalone line, ending any in-place status line first
    pub fn notice(&self, text: &str) {
        if !self.enabled {
            return;
        }
        let mut console = self.lock_console();
        let prefix = if console.in_place { "\n" } else { "" };
        console.in_place = false;
        let result = writeln!(console.out, "{}{}", prefix, text).and_then(|_| console.out.flush());
        if let Err(e) = result {
            debug!(error = %e, "Console write failed");
        }
    }

    /// Print lifetime totals, whatever the display mode
    pub fn totals(&self, total: u64, current: i64, lifetime_rate: f64) {
        info!(
            total_accepted = total,
            current_count = current,
            rate = lifetime_rate,
            "Statistics requested"
        );
        self.notice(&format!(
            "Statistics: {} accepted, current count {}, {:.1} counts/sec overall",
            total, current, lifetime_rate
        ));
    }

    /// Periodic summary of progress. Skipped while the display is in fast
    /// mode, where the status line already shows the same numbers.
    pub async fn run_stats_loop(
        self: Arc<Self>,
        state: Arc<CountState>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut last_total = state.total();
        let mut last_at = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let total = state.total();
            let secs = now.saturating_duration_since(last_at).as_secs_f64();
            let rate = if secs > 0.0 {
                total.saturating_sub(last_total) as f64 / secs
            } else {
                0.0
            };
            last_total = total;
            last_at = now;

            if self.mode() == DisplayMode::Fast {
                continue;
            }

            info!(
                total_accepted = total,
                current_count = state.current(),
                rate = rate,
                "Statistics"
            );
            self.notice(&format!(
                "Statistics: {} accepted, current count {}, {:.1} counts/sec over the last {:.0}s",
                total,
                state.current(),
                rate,
                secs
            ));
        }

        debug!("Statistics loop stopped");
    }

    fn lock_console(&self) -> std::sync::MutexGuard<'_, Console> {
        match self.console.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Console mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
