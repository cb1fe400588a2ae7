//! Queue statistics.
//!
//! Rolling averages are exponentially weighted so a handful of slow requests
//! moves them quickly while a long history does not pin them.

use std::time::Duration;
use serde::Serialize;

const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default, Clone, Copy)]
struct Ewma(Option<f64>);

impl Ewma {
    fn record(&mut self, sample: f64) {
        self.0 = Some(match self.0 {
            Some(avg) => avg + EWMA_ALPHA * (sample - avg),
            None => sample,
        });
    }

    fn value(&self) -> Option<f64> {
        self.0
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    pub(crate) enqueued: u64,
    pub(crate) processed: u64,
    pub(crate) timeouts: u64,
    pub(crate) errors: u64,
    pub(crate) rejected: u64,
    wait_ms: Ewma,
    processing_ms: Ewma,
}

impl QueueStats {
    pub(crate) fn record_wait(&mut self, waited: Duration) {
        self.wait_ms.record(waited.as_secs_f64() * 1000.0);
    }

    pub(crate) fn record_processing(&mut self, took: Duration, success: bool) {
        self.processed += 1;
        if !success {
            self.errors += 1;
        }
        self.processing_ms.record(took.as_secs_f64() * 1000.0);
    }

    pub(crate) fn avg_wait(&self) -> Duration {
        Duration::from_secs_f64(self.wait_ms.value().unwrap_or(0.0).max(0.0) / 1000.0)
    }

    pub(crate) fn avg_processing(&self) -> Option<Duration> {
        self.processing_ms.value().map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    pub(crate) fn avg_wait_ms(&self) -> Option<f64> {
        self.wait_ms.value()
    }

    pub(crate) fn avg_processing_ms(&self) -> Option<f64> {
        self.processing_ms.value()
    }
}

/// Point-in-time view of a request queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub server: String,
    pub depth: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub max_size: usize,
    pub closed: bool,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_timeouts: u64,
    pub total_errors: u64,
    pub total_rejected: u64,
    pub avg_wait_ms: Option<f64>,
    pub avg_processing_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_tracks_recent_samples() {
        let mut stats = QueueStats::default();
        assert_eq!(stats.avg_wait(), Duration::ZERO);
        assert!(stats.avg_processing().is_none());

        stats.record_wait(Duration::from_millis(100));
        assert_eq!(stats.avg_wait_ms(), Some(100.0));
        stats.record_wait(Duration::from_millis(200));
        let avg = stats.avg_wait_ms().unwrap();
        assert!((avg - 120.0).abs() < 1e-9);

        stats.record_processing(Duration::from_millis(10), true);
        stats.record_processing(Duration::from_millis(10), false);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.errors, 1);
    }
}
