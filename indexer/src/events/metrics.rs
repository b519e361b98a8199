//! Metrics tracking for the event pipeline.
//!
//! Provides atomic counters for monitoring log classification, protocol
//! handlers and reconciliation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for the event pipeline.
#[derive(Debug)]
pub struct EventMetrics {
    /// Logs resolved to a known event kind.
    logs_classified: AtomicU64,

    /// Logs with no registered signature.
    logs_skipped: AtomicU64,

    /// Fill events accumulated.
    fills: AtomicU64,

    /// Cancellations of any kind accumulated.
    cancels: AtomicU64,

    /// Maker-state triggers accumulated.
    triggers: AtomicU64,

    /// Protocol handler arms that failed.
    handler_errors: AtomicU64,

    /// Fill events the reconciler could not match.
    reconciliation_misses: AtomicU64,

    /// Batches processed.
    batches: AtomicU64,

    /// Total processing time in nanoseconds.
    total_processing_time_ns: AtomicU64,

    /// Start time for rate calculation.
    start_time: Instant,
}

impl Default for EventMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs_classified: AtomicU64::new(0),
            logs_skipped: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            reconciliation_misses: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            total_processing_time_ns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records a processed batch.
    pub fn record_batch(&self, fills: u64, cancels: u64, triggers: u64, duration: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.fills.fetch_add(fills, Ordering::Relaxed);
        self.cancels.fetch_add(cancels, Ordering::Relaxed);
        self.triggers.fetch_add(triggers, Ordering::Relaxed);
        self.total_processing_time_ns.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Records classified logs.
    pub fn record_classified(&self, count: u64) {
        self.logs_classified.fetch_add(count, Ordering::Relaxed);
    }

    /// Records an unknown log.
    pub fn record_skipped(&self) {
        self.logs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed handler arm.
    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a fill the reconciler could not match.
    pub fn record_reconciliation_miss(&self) {
        self.reconciliation_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of classified logs.
    #[must_use]
    pub fn logs_classified(&self) -> u64 {
        self.logs_classified.load(Ordering::Relaxed)
    }

    /// Returns the number of skipped logs.
    #[must_use]
    pub fn logs_skipped(&self) -> u64 {
        self.logs_skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of fills.
    #[must_use]
    pub fn fills(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }

    /// Returns the number of cancels.
    #[must_use]
    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::Relaxed)
    }

    /// Returns the number of maker-state triggers.
    #[must_use]
    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }

    /// Returns the number of failed handler arms.
    #[must_use]
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Returns the number of reconciliation misses.
    #[must_use]
    pub fn reconciliation_misses(&self) -> u64 {
        self.reconciliation_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of batches.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Returns the average processing time per batch.
    #[must_use]
    pub fn average_batch_time(&self) -> Duration {
        let count = self.batches();
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_processing_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Returns logs classified per second since start.
    #[must_use]
    pub fn logs_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.logs_classified() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> EventMetricsSnapshot {
        EventMetricsSnapshot {
            logs_classified: self.logs_classified(),
            logs_skipped: self.logs_skipped(),
            fills: self.fills(),
            cancels: self.cancels(),
            triggers: self.triggers(),
            handler_errors: self.handler_errors(),
            reconciliation_misses: self.reconciliation_misses(),
            batches: self.batches(),
            average_batch_time: self.average_batch_time(),
            logs_per_second: self.logs_per_second(),
        }
    }
}

/// A point-in-time snapshot of event metrics.
#[derive(Debug, Clone)]
pub struct EventMetricsSnapshot {
    /// Logs classified.
    pub logs_classified: u64,
    /// Logs skipped.
    pub logs_skipped: u64,
    /// Fills.
    pub fills: u64,
    /// Cancels.
    pub cancels: u64,
    /// Maker-state triggers.
    pub triggers: u64,
    /// Failed handler arms.
    pub handler_errors: u64,
    /// Reconciliation misses.
    pub reconciliation_misses: u64,
    /// Batches.
    pub batches: u64,
    /// Average batch time.
    pub average_batch_time: Duration,
    /// Logs per second.
    pub logs_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = EventMetrics::new();
        assert_eq!(metrics.logs_classified(), 0);
        assert_eq!(metrics.fills(), 0);
        assert_eq!(metrics.handler_errors(), 0);
        assert_eq!(metrics.average_batch_time(), Duration::ZERO);
    }

    #[test]
    fn test_metrics_record_batch() {
        let metrics = EventMetrics::new();
        metrics.record_batch(5, 3, 2, Duration::from_micros(100));
        metrics.record_batch(1, 0, 0, Duration::from_micros(300));

        assert_eq!(metrics.batches(), 2);
        assert_eq!(metrics.fills(), 6);
        assert_eq!(metrics.cancels(), 3);
        assert_eq!(metrics.triggers(), 2);
        assert_eq!(metrics.average_batch_time(), Duration::from_micros(200));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = EventMetrics::new();
        metrics.record_classified(4);
        metrics.record_skipped();
        metrics.record_handler_error();
        metrics.record_reconciliation_miss();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.logs_classified, 4);
        assert_eq!(snapshot.logs_skipped, 1);
        assert_eq!(snapshot.handler_errors, 1);
        assert_eq!(snapshot.reconciliation_misses, 1);
    }
}
