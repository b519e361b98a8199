//! Static queue declarations.
//!
//! Every handler declares one [`QueueDescriptor`] at startup. Queue names for
//! the priority and dead-letter bindings are derived from the handler name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Suffix of the priority queue bound next to a standard queue.
pub const PRIORITY_SUFFIX: &str = "-priority";

/// Suffix of the dead-letter queue of a handler.
pub const DEAD_LETTER_SUFFIX: &str = "-dead-letter";

/// Minimum lock lease for jobs carrying a job id.
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Class of a queue binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueClass {
    /// Regular FIFO-by-due-time queue.
    Standard,
    /// Queue polled ahead of the standard one.
    Priority,
    /// Terminal queue for exhausted messages.
    DeadLetter,
}

impl QueueClass {
    /// Returns the suffix appended to the handler name.
    #[must_use]
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::Standard => "",
            Self::Priority => PRIORITY_SUFFIX,
            Self::DeadLetter => DEAD_LETTER_SUFFIX,
        }
    }
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "delay_ms")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Constant delay in milliseconds.
    Fixed(u64),
    /// `2^(retry_count - 1) * base` milliseconds.
    Exponential(u64),
}

impl Default for Backoff {
    fn default() -> Self {
        Self::None
    }
}

impl Backoff {
    /// Returns the delay before the given retry (1-indexed).
    ///
    /// Saturates instead of overflowing for very large retry counts.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(ms) => Duration::from_millis(ms),
            Self::Exponential(base) => {
                if retry_count == 0 {
                    return Duration::ZERO;
                }
                let factor = 2_u64
                    .checked_pow(retry_count - 1)
                    .unwrap_or(u64::MAX);
                Duration::from_millis(base.saturating_mul(factor))
            }
        }
    }
}

/// Immutable declaration of a handler's queue and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Handler name; the standard queue name.
    pub name: String,

    /// Class of the primary binding.
    pub class: QueueClass,

    /// Retries allowed before dead-lettering.
    pub max_retries: u32,

    /// Number of parallel consumers.
    pub concurrency: usize,

    /// Per-attempt timeout in milliseconds (0 = unbounded).
    pub timeout_ms: u64,

    /// Retry delay policy.
    pub backoff: Backoff,

    /// Only one consumer may be active for this queue.
    pub single_active_consumer: bool,

    /// Whether the broker should persist messages.
    pub persistent: bool,

    /// Whether a `-priority` queue is bound next to the standard one.
    pub use_priority_queue: bool,

    /// Interval of the dead-letter sweep, if enabled.
    pub dead_letter_sweep_ms: Option<u64>,
}

impl QueueDescriptor {
    /// Creates a descriptor with defaults for the given handler name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: QueueClass::Standard,
            max_retries: 5,
            concurrency: 1,
            timeout_ms: 0,
            backoff: Backoff::None,
            single_active_consumer: false,
            persistent: true,
            use_priority_queue: false,
            dead_letter_sweep_ms: None,
        }
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the consumer pool size.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Restricts the queue to a single active consumer.
    #[must_use]
    pub fn single_active_consumer(mut self) -> Self {
        self.single_active_consumer = true;
        self
    }

    /// Binds a priority queue next to the standard queue.
    #[must_use]
    pub fn with_priority_queue(mut self) -> Self {
        self.use_priority_queue = true;
        self
    }

    /// Enables the periodic dead-letter sweep.
    #[must_use]
    pub fn with_dead_letter_sweep(mut self, interval: Duration) -> Self {
        self.dead_letter_sweep_ms = Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Marks messages as transient.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Returns the standard queue name.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.name
    }

    /// Returns the priority queue name.
    #[must_use]
    pub fn priority_queue_name(&self) -> String {
        format!("{}{}", self.name, PRIORITY_SUFFIX)
    }

    /// Returns the dead-letter queue name.
    #[must_use]
    pub fn dead_letter_queue_name(&self) -> String {
        format!("{}{}", self.name, DEAD_LETTER_SUFFIX)
    }

    /// Returns the per-attempt timeout, `None` when unbounded.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Returns the dead-letter sweep interval, if enabled.
    #[must_use]
    pub fn dead_letter_sweep(&self) -> Option<Duration> {
        self.dead_letter_sweep_ms.map(Duration::from_millis)
    }

    /// Lease length for job locks and broker deliveries:
    /// `max(timeout, 5 minutes)`.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.timeout().map_or(MIN_LOCK_TTL, |t| t.max(MIN_LOCK_TTL))
    }

    /// Effective number of consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        if self.single_active_consumer {
            1
        } else {
            self.concurrency.max(1)
        }
    }

    /// Validates the descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or carries a reserved suffix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidQueueName(self.name.clone()));
        }
        if self.name.ends_with(PRIORITY_SUFFIX) || self.name.ends_with(DEAD_LETTER_SUFFIX) {
            return Err(ConfigError::InvalidQueueName(self.name.clone()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.name.clone()));
        }
        if self.dead_letter_sweep_ms == Some(0) {
            return Err(ConfigError::InvalidSweepInterval(self.name.clone()));
        }
        Ok(())
    }
}
