//! Job producer.
//!
//! Sends payloads to a handler's queue, collapsing duplicate sends that share
//! a job id while the first one is still pending or running.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::descriptor::QueueDescriptor;
use crate::error::BrokerError;
use crate::lock::LockService;
use crate::message::{lock_key, JobMessage};
use crate::metrics::JobMetrics;

/// Options for a single send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Dedup/lock key.
    pub job_id: Option<String>,
    /// Delay before the message becomes visible.
    pub delay: Duration,
    /// Non-zero priorities go to the priority queue when one is bound.
    pub priority: u8,
}

impl SendOptions {
    /// Options with a dedup key.
    #[must_use]
    pub fn with_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    /// Sets the delay.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was published to the named queue.
    Queued {
        /// Queue the message landed on.
        queue: String,
    },
    /// A job with the same id is already pending; nothing was published.
    Deduplicated,
}

impl SendOutcome {
    /// Returns true if a message was published.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// Producer handle shared by everything that enqueues jobs.
#[derive(Clone)]
pub struct JobQueue {
    broker: Arc<dyn Broker>,
    locks: Arc<dyn LockService>,
    metrics: Arc<JobMetrics>,
}

impl JobQueue {
    /// Creates a producer.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, locks: Arc<dyn LockService>) -> Self {
        Self {
            broker,
            locks,
            metrics: Arc::new(JobMetrics::new()),
        }
    }

    /// Records into shared metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<JobMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sends a payload to the handler described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the publish. Lock failures are
    /// logged and the message is sent anyway.
    pub async fn send(
        &self,
        descriptor: &QueueDescriptor,
        payload: Value,
        options: SendOptions,
    ) -> Result<SendOutcome, BrokerError> {
        let queue = if options.priority > 0 && descriptor.use_priority_queue {
            descriptor.priority_queue_name()
        } else {
            descriptor.queue_name().to_string()
        };

        let mut message = JobMessage::new(payload);

        if let Some(job_id) = options.job_id {
            let key = lock_key(descriptor.queue_name(), &job_id);
            match self.locks.acquire(&key, descriptor.lock_ttl()).await {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.record_deduplicated();
                    debug!(queue = %queue, job_id = %job_id, "job already pending, skipping send");
                    return Ok(SendOutcome::Deduplicated);
                }
                Err(e) => {
                    self.metrics.record_lock_failure();
                    warn!(queue = %queue, job_id = %job_id, error = %e, "failed to acquire job lock, sending anyway");
                }
            }
            message = message.with_job_id(job_id);
        }

        let body = message
            .encode()
            .map_err(|e| BrokerError::Command(format!("failed to encode job message: {e}")))?;
        if let Err(e) = self.broker.publish(&queue, body, options.delay).await {
            self.metrics.record_broker_error();
            return Err(e);
        }

        Ok(SendOutcome::Queued { queue })
    }

    /// Returns the underlying broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Returns the underlying lock service.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    /// Returns the producer metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<JobMetrics> {
        Arc::clone(&self.metrics)
    }
}
