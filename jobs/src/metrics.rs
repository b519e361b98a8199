//! Job runtime metrics.
//!
//! Atomic counters shared by every consumer of a runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for job processing.
#[derive(Debug)]
pub struct JobMetrics {
    /// Handler attempts started.
    attempts: AtomicU64,
    /// Attempts that succeeded.
    completed: AtomicU64,
    /// Failed attempts that were republished.
    retried: AtomicU64,
    /// Messages moved to a dead-letter queue.
    dead_lettered: AtomicU64,
    /// Undecodable messages acknowledged and dropped.
    dropped: AtomicU64,
    /// Attempts aborted by the timeout.
    timeouts: AtomicU64,
    /// Lock operations that failed.
    lock_failures: AtomicU64,
    /// Broker operations that failed.
    broker_errors: AtomicU64,
    /// Sends collapsed by the job lock.
    deduplicated: AtomicU64,
    /// Deliveries whose lease expired and that were handed out again.
    redelivered: AtomicU64,
    start_time: Instant,
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMetrics {
    /// Creates a new metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            lock_failures: AtomicU64::new(0),
            broker_errors: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records the start of an attempt.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful attempt.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry.
    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dead-lettered message.
    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped message.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a timed-out attempt.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed lock operation.
    pub fn record_lock_failure(&self) {
        self.lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed broker operation.
    pub fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a deduplicated send.
    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Records deliveries returned to their queue after a lost lease.
    pub fn record_redelivered(&self, count: u64) {
        self.redelivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns attempts started.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns completed attempts.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Returns retries scheduled.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Returns dead-lettered messages.
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Returns dropped messages.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns timed-out attempts.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Returns failed lock operations.
    #[must_use]
    pub fn lock_failures(&self) -> u64 {
        self.lock_failures.load(Ordering::Relaxed)
    }

    /// Returns failed broker operations.
    #[must_use]
    pub fn broker_errors(&self) -> u64 {
        self.broker_errors.load(Ordering::Relaxed)
    }

    /// Returns deduplicated sends.
    #[must_use]
    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    /// Returns deliveries recovered from expired leases.
    #[must_use]
    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    /// Returns the uptime.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns the share of attempts that succeeded (0.0 to 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts > 0 {
            self.completed() as f64 / attempts as f64
        } else {
            0.0
        }
    }

    /// Returns a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            attempts: self.attempts(),
            completed: self.completed(),
            retried: self.retried(),
            dead_lettered: self.dead_lettered(),
            dropped: self.dropped(),
            timeouts: self.timeouts(),
            lock_failures: self.lock_failures(),
            broker_errors: self.broker_errors(),
            deduplicated: self.deduplicated(),
            redelivered: self.redelivered(),
            uptime: self.uptime(),
            success_rate: self.success_rate(),
        }
    }
}

/// A point-in-time snapshot of job metrics.
#[derive(Debug, Clone)]
pub struct JobMetricsSnapshot {
    /// Attempts started.
    pub attempts: u64,
    /// Completed attempts.
    pub completed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Dead-lettered messages.
    pub dead_lettered: u64,
    /// Dropped messages.
    pub dropped: u64,
    /// Timed-out attempts.
    pub timeouts: u64,
    /// Failed lock operations.
    pub lock_failures: u64,
    /// Failed broker operations.
    pub broker_errors: u64,
    /// Deduplicated sends.
    pub deduplicated: u64,
    /// Deliveries recovered from expired leases.
    pub redelivered: u64,
    /// Uptime.
    pub uptime: Duration,
    /// Success rate.
    pub success_rate: f64,
}
