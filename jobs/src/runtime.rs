//! Job runtime.
//!
//! Runs one worker pool per registered handler. Each worker polls the
//! handler's priority queue, then its standard queue, and drives every
//! delivery through [`JobRuntime::consume`]. Before each receive, deliveries
//! whose lease expired without an ack are put back on their queue.
//!
//! 1. decode the envelope, dropping poison messages
//! 2. extend the job lock and the delivery lease while the attempt runs
//! 3. race the attempt against the queue timeout
//! 4. on success ack and release the lock
//! 5. on failure republish with backoff, or route to the dead-letter queue
//!    once the retry budget is spent, and only then ack

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::{BrokerError, JobError, RuntimeError};
use crate::handler::JobHandler;
use crate::lock::LockService;
use crate::message::JobMessage;
use crate::metrics::JobMetrics;
use crate::queue::JobQueue;
use crate::registry::HandlerRegistry;
use crate::sweep::DeadLetterSweeper;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler succeeded.
    Completed,
    /// The handler failed and the message was republished with a delay.
    Retried {
        /// Retry count carried by the republished message.
        retry_count: u32,
        /// Delay before redelivery.
        delay: Duration,
    },
    /// The retry budget is spent and the message went to the dead-letter queue.
    DeadLettered {
        /// Retry count carried by the dead-lettered message.
        retry_count: u32,
    },
    /// The body was not a valid envelope and was discarded.
    Dropped,
}

/// The job runtime.
#[derive(Clone)]
pub struct JobRuntime {
    /// Handlers by queue name.
    registry: Arc<HandlerRegistry>,

    /// Producer sharing the broker and lock service.
    queue: JobQueue,

    /// Dead-letter replay.
    sweeper: DeadLetterSweeper,

    /// Configuration.
    config: RuntimeConfig,

    /// Metrics.
    metrics: Arc<JobMetrics>,

    /// Whether the workers should keep polling.
    running: Arc<AtomicBool>,
}

impl JobRuntime {
    /// Creates a runtime over the given registry and backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or any queue descriptor is
    /// invalid.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        broker: Arc<dyn Broker>,
        locks: Arc<dyn LockService>,
        config: RuntimeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        for handler in registry.iter() {
            handler.descriptor().validate()?;
        }

        let metrics = Arc::new(JobMetrics::new());
        let queue = JobQueue::new(Arc::clone(&broker), Arc::clone(&locks))
            .with_metrics(Arc::clone(&metrics));

        Ok(Self {
            registry,
            queue,
            sweeper: DeadLetterSweeper::new(broker, locks),
            config,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a producer bound to the same broker and locks.
    #[must_use]
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<JobMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the handler registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Returns the dead-letter sweeper.
    #[must_use]
    pub const fn sweeper(&self) -> &DeadLetterSweeper {
        &self.sweeper
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns true if the workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the workers after their current delivery.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        info!("Job runtime stop requested");
    }

    fn broker(&self) -> &Arc<dyn Broker> {
        self.queue.broker()
    }

    fn locks(&self) -> &Arc<dyn LockService> {
        self.queue.locks()
    }

    /// Spawns the worker pools and the dead-letter sweeps.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::Relaxed);

        let mut tasks = Vec::new();
        for handler in self.registry.iter() {
            let descriptor = handler.descriptor();
            let workers = descriptor.consumer_count();
            for worker in 0..workers {
                let runtime = self.clone();
                let handler = Arc::clone(handler);
                tasks.push(tokio::spawn(async move {
                    runtime.worker_loop(handler, worker).await;
                }));
            }
            if let Some(task) = self
                .sweeper
                .spawn(descriptor.clone(), Arc::clone(&self.running))
            {
                tasks.push(task);
            }
            info!(
                queue = %descriptor.queue_name(),
                workers,
                priority = descriptor.use_priority_queue,
                "Started job consumers"
            );
        }
        tasks
    }

    async fn worker_loop(&self, handler: Arc<dyn JobHandler>, worker: usize) {
        let poll_interval = self.config.poll_interval();
        let queue = handler.descriptor().queue_name().to_string();
        debug!(queue = %queue, worker, "Job worker started");

        while self.is_running() {
            match self.poll_handler(&handler).await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    self.metrics.record_broker_error();
                    warn!(queue = %queue, worker, error = %e, "Broker error while consuming");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        debug!(queue = %queue, worker, "Job worker stopped");
    }

    /// Takes and consumes one due message for a handler, priority queue
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if a broker call fails.
    pub async fn poll_handler(
        &self,
        handler: &Arc<dyn JobHandler>,
    ) -> Result<Option<ConsumeOutcome>, BrokerError> {
        let descriptor = handler.descriptor();
        let lease = descriptor.lock_ttl();

        if descriptor.use_priority_queue {
            let priority = descriptor.priority_queue_name();
            self.recover_expired(&priority).await?;
            if let Some(delivery) = self.broker().receive(&priority, lease).await? {
                return self.consume(handler.as_ref(), delivery).await.map(Some);
            }
        }

        self.recover_expired(descriptor.queue_name()).await?;
        match self
            .broker()
            .receive(descriptor.queue_name(), lease)
            .await?
        {
            Some(delivery) => self.consume(handler.as_ref(), delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Consumes one due message of the named queue.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler is registered or a broker call fails.
    pub async fn poll_once(&self, queue: &str) -> Result<Option<ConsumeOutcome>, RuntimeError> {
        let handler = self.registry.require(queue)?;
        Ok(self.poll_handler(&handler).await?)
    }

    /// Consumes due messages of the named queue until none is left.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler is registered or a broker call fails.
    pub async fn drain_ready(&self, queue: &str) -> Result<Vec<ConsumeOutcome>, RuntimeError> {
        let handler = self.registry.require(queue)?;
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.poll_handler(&handler).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Runs one delivery through its handler.
    ///
    /// # Errors
    ///
    /// Returns an error if acknowledging or republishing fails. The delivery
    /// is then left unacknowledged and handed out again once its lease
    /// expires.
    pub async fn consume(
        &self,
        handler: &dyn JobHandler,
        delivery: Delivery,
    ) -> Result<ConsumeOutcome, BrokerError> {
        let descriptor = handler.descriptor();

        let mut message = match JobMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %delivery.queue, error = %e, "Dropping undecodable job message");
                self.metrics.record_dropped();
                self.ack(&delivery).await?;
                return Ok(ConsumeOutcome::Dropped);
            }
        };

        let lock_key = message.lock_key(descriptor.queue_name());
        if let Some(key) = &lock_key {
            self.extend_lock(key, descriptor.lock_ttl()).await;
        }

        message.last_attempt_at = Some(Utc::now());
        self.metrics.record_attempt();

        match self
            .run_attempt(handler, &delivery, &message, lock_key.as_deref())
            .await
        {
            Ok(result) => {
                self.ack(&delivery).await?;
                if let Some(key) = &lock_key {
                    self.release_lock(key).await;
                }
                message.completed_at = Some(Utc::now());
                self.metrics.record_completed();
                debug!(queue = %delivery.queue, retry_count = message.retry_count, "Job completed");

                if let Err(e) = handler.on_completed(&message, &result).await {
                    warn!(queue = %delivery.queue, error = %e, "on_completed hook failed");
                }
                Ok(ConsumeOutcome::Completed)
            }
            Err(error) => {
                self.handle_failure(handler, delivery, message, lock_key, error)
                    .await
            }
        }
    }

    async fn run_attempt(
        &self,
        handler: &dyn JobHandler,
        delivery: &Delivery,
        message: &JobMessage,
        lock_key: Option<&str>,
    ) -> Result<Value, JobError> {
        let descriptor = handler.descriptor();
        let replay = message.is_exhausted(descriptor.max_retries);

        let attempt = async {
            let work = async {
                if replay {
                    handler.process_dead_letter(&message.payload).await
                } else {
                    handler.process(&message.payload).await
                }
            };
            match descriptor.timeout() {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or_else(|_| Err(JobError::Timeout(limit))),
                None => work.await,
            }
        };

        let ttl = descriptor.lock_ttl();
        let period = ttl / 2;
        let mut ticker = interval_at(Instant::now() + period, period);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return result,
                _ = ticker.tick() => {
                    if let Some(key) = lock_key {
                        self.extend_lock(key, ttl).await;
                    }
                    self.touch_delivery(delivery, ttl).await;
                }
            }
        }
    }

    async fn handle_failure(
        &self,
        handler: &dyn JobHandler,
        delivery: Delivery,
        mut message: JobMessage,
        lock_key: Option<String>,
        error: JobError,
    ) -> Result<ConsumeOutcome, BrokerError> {
        let descriptor = handler.descriptor();

        if error.is_timeout() {
            self.metrics.record_timeout();
        }
        if let Err(e) = handler.on_error(&message, &error).await {
            warn!(queue = %delivery.queue, error = %e, "on_error hook failed");
        }

        message.retry_count = message.retry_count.saturating_add(1);
        let retry_count = message.retry_count;

        if message.is_exhausted(descriptor.max_retries) {
            message.job_id = None;
            if let Some(key) = &lock_key {
                self.release_lock(key).await;
            }

            let dead_letter_queue = descriptor.dead_letter_queue_name();
            self.republish(&dead_letter_queue, &message, Duration::ZERO)
                .await?;
            self.ack(&delivery).await?;
            self.metrics.record_dead_letter();

            error!(
                queue = %delivery.queue,
                dead_letter_queue = %dead_letter_queue,
                payload = %message.payload,
                retry_count,
                error = %error,
                "Job exhausted its retries"
            );
            return Ok(ConsumeOutcome::DeadLettered { retry_count });
        }

        let delay = descriptor.backoff.delay(retry_count);
        self.republish(&delivery.queue, &message, delay).await?;
        self.ack(&delivery).await?;
        self.metrics.record_retry();

        warn!(
            queue = %delivery.queue,
            retry_count,
            max_retries = descriptor.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Job failed, scheduling retry"
        );
        Ok(ConsumeOutcome::Retried { retry_count, delay })
    }

    async fn republish(
        &self,
        queue: &str,
        message: &JobMessage,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let body = message
            .encode()
            .map_err(|e| BrokerError::Command(format!("failed to encode job message: {e}")))?;
        if let Err(e) = self.broker().publish(queue, body, delay).await {
            self.metrics.record_broker_error();
            return Err(e);
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        if let Err(e) = self.broker().ack(delivery).await {
            self.metrics.record_broker_error();
            return Err(e);
        }
        Ok(())
    }

    async fn recover_expired(&self, queue: &str) -> Result<(), BrokerError> {
        let recovered = match self.broker().recover(queue).await {
            Ok(recovered) => recovered,
            Err(e) => {
                self.metrics.record_broker_error();
                return Err(e);
            }
        };
        if recovered > 0 {
            self.metrics
                .record_redelivered(u64::try_from(recovered).unwrap_or(u64::MAX));
            warn!(queue, recovered, "Requeued deliveries with expired leases");
        }
        Ok(())
    }

    async fn touch_delivery(&self, delivery: &Delivery, lease: Duration) {
        match self.broker().touch(delivery, lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(queue = %delivery.queue, tag = %delivery.tag, "Delivery lease lost, message may run twice");
            }
            Err(e) => {
                self.metrics.record_broker_error();
                warn!(queue = %delivery.queue, error = %e, "Failed to extend delivery lease");
            }
        }
    }

    async fn extend_lock(&self, key: &str, ttl: Duration) {
        if let Err(e) = self.locks().extend(key, ttl).await {
            self.metrics.record_lock_failure();
            warn!(lock = %key, error = %e, "Failed to extend job lock");
        }
    }

    async fn release_lock(&self, key: &str) {
        if let Err(e) = self.locks().release(key).await {
            self.metrics.record_lock_failure();
            warn!(lock = %key, error = %e, "Failed to release job lock");
        }
    }
}
