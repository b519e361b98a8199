//! Scheduled dead-letter replay.
//!
//! A handler that declares a sweep interval gets a periodic task on every
//! replica. Each tick the replicas race for `sweep:<name>`; the winner drains
//! the dead-letter queue and republishes every message onto the standard
//! queue, where it is consumed through `process_dead_letter`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::descriptor::QueueDescriptor;
use crate::error::BrokerError;
use crate::lock::LockService;

/// Lease used when a sweep is triggered on a queue without a sweep interval.
const DEFAULT_SWEEP_LEASE: Duration = Duration::from_secs(60);

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another replica holds the sweep lock.
    Skipped,
    /// Number of messages moved back onto the standard queue.
    Replayed(usize),
}

/// Builds the cluster-wide lock key of a sweep.
#[must_use]
pub fn sweep_lock_key(queue: &str) -> String {
    format!("sweep:{queue}")
}

/// Replays dead-lettered messages.
#[derive(Clone)]
pub struct DeadLetterSweeper {
    broker: Arc<dyn Broker>,
    locks: Arc<dyn LockService>,
}

impl DeadLetterSweeper {
    /// Creates a sweeper.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, locks: Arc<dyn LockService>) -> Self {
        Self { broker, locks }
    }

    /// Lease of the sweep lock: 90% of the interval, so the next tick can
    /// take it again.
    fn lease(descriptor: &QueueDescriptor) -> Duration {
        descriptor
            .dead_letter_sweep()
            .map_or(DEFAULT_SWEEP_LEASE, |interval| {
                interval.mul_f64(0.9).max(Duration::from_millis(1))
            })
    }

    /// Runs one sweep for a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if draining or republishing fails. Messages not yet
    /// republished are put back on the dead-letter queue.
    pub async fn sweep(&self, descriptor: &QueueDescriptor) -> Result<SweepOutcome, BrokerError> {
        let key = sweep_lock_key(descriptor.queue_name());
        match self.locks.acquire(&key, Self::lease(descriptor)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(queue = %descriptor.queue_name(), "sweep lock held elsewhere");
                return Ok(SweepOutcome::Skipped);
            }
            Err(e) => {
                warn!(queue = %descriptor.queue_name(), error = %e, "sweep lock unavailable, skipping sweep");
                return Ok(SweepOutcome::Skipped);
            }
        }

        let dead_letter_queue = descriptor.dead_letter_queue_name();
        let bodies = self.broker.drain(&dead_letter_queue).await?;
        let total = bodies.len();

        let mut pending = bodies.into_iter();
        while let Some(body) = pending.next() {
            if let Err(e) = self
                .broker
                .publish(descriptor.queue_name(), body.clone(), Duration::ZERO)
                .await
            {
                self.restore(&dead_letter_queue, std::iter::once(body).chain(pending))
                    .await;
                return Err(e);
            }
        }

        if total > 0 {
            info!(queue = %descriptor.queue_name(), replayed = total, "replayed dead-letter queue");
        }
        Ok(SweepOutcome::Replayed(total))
    }

    async fn restore(&self, dead_letter_queue: &str, bodies: impl Iterator<Item = Vec<u8>>) {
        for body in bodies {
            if let Err(e) = self
                .broker
                .publish(dead_letter_queue, body, Duration::ZERO)
                .await
            {
                warn!(queue = %dead_letter_queue, error = %e, "failed to restore dead-lettered message");
            }
        }
    }

    /// Spawns the periodic sweep of a queue. Returns `None` when the queue
    /// has no sweep interval.
    pub fn spawn(
        &self,
        descriptor: QueueDescriptor,
        running: Arc<AtomicBool>,
    ) -> Option<JoinHandle<()>> {
        let interval = descriptor.dead_letter_sweep()?;
        let sweeper = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = sweeper.sweep(&descriptor).await {
                    warn!(queue = %descriptor.queue_name(), error = %e, "dead-letter sweep failed");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::lock::{InMemoryLockService, LockTable};
    use async_trait::async_trait;

    fn descriptor() -> QueueDescriptor {
        QueueDescriptor::new("order-updates").with_dead_letter_sweep(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_sweep_replays_dead_letters() {
        let broker = Arc::new(InMemoryBroker::new());
        let sweeper = DeadLetterSweeper::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        );
        for body in [b"a".to_vec(), b"b".to_vec()] {
            broker
                .publish("order-updates-dead-letter", body, Duration::ZERO)
                .await
                .expect("publish");
        }

        let outcome = sweeper.sweep(&descriptor()).await.expect("sweep");

        assert_eq!(outcome, SweepOutcome::Replayed(2));
        assert_eq!(broker.len("order-updates-dead-letter").await.expect("len"), 0);
        assert_eq!(
            broker.peek("order-updates").await,
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_sweep_only_one_replica_wins() {
        let broker = Arc::new(InMemoryBroker::new());
        let table = LockTable::new();
        let a = DeadLetterSweeper::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::with_table(Arc::clone(&table), "a")),
        );
        let b = DeadLetterSweeper::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::with_table(table, "b")),
        );
        broker
            .publish("order-updates-dead-letter", b"x".to_vec(), Duration::ZERO)
            .await
            .expect("publish");

        let first = a.sweep(&descriptor()).await.expect("sweep");
        let second = b.sweep(&descriptor()).await.expect("sweep");

        assert_eq!(first, SweepOutcome::Replayed(1));
        assert_eq!(second, SweepOutcome::Skipped);
        assert_eq!(broker.len("order-updates").await.expect("len"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_lock_lapses_before_next_tick() {
        let broker = Arc::new(InMemoryBroker::new());
        let sweeper = DeadLetterSweeper::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        );

        assert_eq!(
            sweeper.sweep(&descriptor()).await.expect("sweep"),
            SweepOutcome::Replayed(0)
        );
        assert_eq!(
            sweeper.sweep(&descriptor()).await.expect("sweep"),
            SweepOutcome::Skipped
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(
            sweeper.sweep(&descriptor()).await.expect("sweep"),
            SweepOutcome::Replayed(0)
        );
    }

    struct RejectingBroker {
        inner: InMemoryBroker,
        reject_queue: &'static str,
    }

    #[async_trait]
    impl Broker for RejectingBroker {
        async fn publish(
            &self,
            queue: &str,
            body: Vec<u8>,
            delay: Duration,
        ) -> Result<(), BrokerError> {
            if queue == self.reject_queue {
                return Err(BrokerError::Command("rejected".to_string()));
            }
            self.inner.publish(queue, body, delay).await
        }

        async fn receive(
            &self,
            queue: &str,
            visibility: Duration,
        ) -> Result<Option<crate::broker::Delivery>, BrokerError> {
            self.inner.receive(queue, visibility).await
        }

        async fn ack(&self, delivery: &crate::broker::Delivery) -> Result<(), BrokerError> {
            self.inner.ack(delivery).await
        }

        async fn touch(
            &self,
            delivery: &crate::broker::Delivery,
            visibility: Duration,
        ) -> Result<bool, BrokerError> {
            self.inner.touch(delivery, visibility).await
        }

        async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
            self.inner.recover(queue).await
        }

        async fn drain(&self, queue: &str) -> Result<Vec<Vec<u8>>, BrokerError> {
            self.inner.drain(queue).await
        }

        async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
            self.inner.len(queue).await
        }
    }

    #[tokio::test]
    async fn test_sweep_failure_restores_dead_letters() {
        let broker = Arc::new(RejectingBroker {
            inner: InMemoryBroker::new(),
            reject_queue: "order-updates",
        });
        broker
            .inner
            .publish("order-updates-dead-letter", b"x".to_vec(), Duration::ZERO)
            .await
            .expect("publish");
        let sweeper = DeadLetterSweeper::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        );

        assert!(sweeper.sweep(&descriptor()).await.is_err());
        assert_eq!(
            broker.len("order-updates-dead-letter").await.expect("len"),
            1
        );
    }

    #[tokio::test]
    async fn test_spawn_requires_interval() {
        let sweeper = DeadLetterSweeper::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryLockService::new()),
        );
        let running = Arc::new(AtomicBool::new(true));
        assert!(sweeper
            .spawn(QueueDescriptor::new("q"), Arc::clone(&running))
            .is_none());

        let handle = sweeper
            .spawn(descriptor(), Arc::clone(&running))
            .expect("sweep task");
        running.store(false, Ordering::Relaxed);
        handle.abort();
    }
}
