use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    /// `publish` / `publish_persisted` calls.
    pub events_published: u64,
    /// Handler executions that succeeded.
    pub events_processed: u64,
    /// Handler executions that failed (including unsupported-type outcomes).
    pub events_failed: u64,
    /// Running mean of whole-publish execution time, in milliseconds.
    pub average_processing_time_ms: f64,
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
}

impl BusMetrics {
    /// Fold one publish into the counters (incremental mean, no history kept).
    pub(crate) fn record_publish(&mut self, elapsed: Duration, succeeded: usize, failed: usize) {
        self.events_published += 1;
        self.events_processed += succeeded as u64;
        self.events_failed += failed as u64;

        let sample = elapsed.as_secs_f64() * 1000.0;
        let n = self.events_published as f64;
        self.average_processing_time_ms += (sample - self.average_processing_time_ms) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let mut m = BusMetrics::default();
        m.record_publish(Duration::from_millis(10), 1, 0);
        m.record_publish(Duration::from_millis(20), 0, 2);
        m.record_publish(Duration::from_millis(30), 3, 0);

        assert_eq!(m.events_published, 3);
        assert_eq!(m.events_processed, 4);
        assert_eq!(m.events_failed, 2);
        assert!((m.average_processing_time_ms - 20.0).abs() < 1e-9);
    }
}
