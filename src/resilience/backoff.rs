//! Exponential backoff with jitter for connection establishment.

use std::time::Duration;
use rand::Rng;

/// Backoff schedule between connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// Delay before retry `attempt` (1-based). Attempt 0 is the initial try.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.ceiling(attempt);

        // Up to 10% jitter so parallel establishers do not retry in lockstep.
        let jitter_range = capped.as_millis() as u64 / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}
