use log::debug;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at};

/// Fixed-rate tick source that never queues work behind an overrunning
/// cycle.
///
/// A tick scheduled before the previous cycle finished is dropped, not
/// run late, so an overrun of one interval costs exactly one tick.
pub struct Cadence {
    ticker: Interval,
    period: Duration,
    finished_at: Option<Instant>,
    skipped: u64,
}

impl Cadence {
    /// First tick fires immediately.
    pub fn new(period: Duration) -> Self {
        Self::from_interval(interval(period), period)
    }

    /// First tick fires one period from now.
    pub fn delayed(period: Duration) -> Self {
        Self::from_interval(interval_at(Instant::now() + period, period), period)
    }

    fn from_interval(mut ticker: Interval, period: Duration) -> Self {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker,
            period,
            finished_at: None,
            skipped: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick that is not stale. Returns its scheduled time.
    pub async fn next_tick(&mut self) -> Instant {
        loop {
            let scheduled = self.ticker.tick().await;
            match self.finished_at {
                Some(finished) if scheduled < finished => {
                    self.skipped += 1;
                    debug!("[pipeline] cycle overran; skipping tick");
                }
                _ => return scheduled,
            }
        }
    }

    /// Record that the cycle started by the last tick has completed.
    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    /// Ticks dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
