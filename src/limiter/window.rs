//! Sliding-window counter.
//!
//! Two fixed windows are kept per tenant; the previous window's count is
//! weighted by how much of it still overlaps the sliding interval:
//!
//! ```text
//! effective = previous * (remaining_in_current / window) + current
//! ```

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct SlidingWindow {
    length: Duration,
    start: Instant,
    epoch: u64,
    current: f64,
    previous: f64,
    /// Weighted usage admitted in the current window; never decremented.
    accumulated: f64,
}

impl SlidingWindow {
    pub(crate) fn new(length: Duration, now: Instant) -> Self {
        Self {
            length: length.max(Duration::from_millis(1)),
            start: now,
            epoch: 0,
            current: 0.0,
            previous: 0.0,
            accumulated: 0.0,
        }
    }

    pub(crate) fn length(&self) -> Duration {
        self.length
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn current(&self) -> f64 {
        self.current
    }

    pub(crate) fn previous(&self) -> f64 {
        self.previous
    }

    pub(crate) fn accumulated(&self) -> f64 {
        self.accumulated
    }

    /// Advance to the window containing `now`.
    pub(crate) fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < self.length {
            return;
        }

        let passed = elapsed.as_nanos() / self.length.as_nanos();
        self.previous = if passed == 1 { self.current } else { 0.0 };
        self.current = 0.0;
        self.accumulated = 0.0;

        let skip = self.length.as_nanos() * passed;
        self.start += Duration::from_nanos(skip.min(u64::MAX as u128) as u64);
        self.epoch += passed.min(u64::MAX as u128) as u64;
    }

    /// Interpolated count over the sliding interval ending at `now`.
    /// Callers rotate first.
    pub(crate) fn effective(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).min(self.length);
        let remaining = (self.length - elapsed).as_secs_f64() / self.length.as_secs_f64();
        self.previous * remaining + self.current
    }

    pub(crate) fn add(&mut self, weight: f64) {
        self.current += weight;
        self.accumulated += weight;
    }

    /// Undo an addition made during window `epoch`. Returns whether anything
    /// was credited.
    pub(crate) fn credit(&mut self, epoch: u64, weight: f64) -> bool {
        if epoch == self.epoch {
            self.current = (self.current - weight).max(0.0);
            true
        } else if epoch + 1 == self.epoch {
            self.previous = (self.previous - weight).max(0.0);
            true
        } else {
            false
        }
    }

    /// True when nothing counts towards the sliding interval any more.
    /// Callers rotate first.
    pub(crate) fn is_idle(&self) -> bool {
        self.current == 0.0 && self.previous == 0.0
    }
}
