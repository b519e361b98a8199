//! Realtime sync poller.
//!
//! Polls the chain head and hands every new block range to the
//! `events-sync` queue. The range doubles as the job id, so a range that is
//! still pending is never enqueued twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orderflow_jobs::{JobQueue, QueueDescriptor, SendOptions};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::error::{IndexerError, TraceError};
use crate::events::cursor::{BlockRange, SyncCursor};
use crate::events::log::RawLog;
use crate::jobs::queues;

/// Source of chain logs.
#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Returns every log emitted in `range`, in chain order.
    async fn get_logs(&self, range: &BlockRange) -> Result<Vec<RawLog>, TraceError>;

    /// Returns the latest block number.
    async fn block_number(&self) -> Result<u64, TraceError>;
}

/// Turns chain head movements into `events-sync` jobs.
pub struct SyncPoller {
    logs: Arc<dyn LogProvider>,
    queue: JobQueue,
    descriptor: QueueDescriptor,
    cursor: Mutex<Option<SyncCursor>>,
    start_block: Option<u64>,
    max_blocks: u64,
    interval: Duration,
}

impl SyncPoller {
    /// Creates a poller from the indexer configuration.
    #[must_use]
    pub fn new(logs: Arc<dyn LogProvider>, queue: JobQueue, config: &IndexerConfig) -> Self {
        Self {
            logs,
            queue,
            descriptor: queues::events_sync(),
            cursor: Mutex::new(None),
            start_block: config.start_block,
            max_blocks: config.max_blocks_per_sync,
            interval: config.poll_interval(),
        }
    }

    /// Returns the last block handed to a sync job, if polling has started.
    pub async fn last_synced(&self) -> Option<u64> {
        self.cursor.lock().await.as_ref().map(|c| c.last_synced)
    }

    /// Polls the head once and enqueues the new ranges.
    ///
    /// The first tick starts after `start_block`, or at the current head
    /// when none is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the head cannot be read or a publish fails. The
    /// cursor has already advanced; ranges lost to a failed publish are
    /// picked up by backfill.
    pub async fn tick(&self) -> Result<Vec<BlockRange>, IndexerError> {
        let head = self.logs.block_number().await?;

        let ranges = {
            let mut guard = self.cursor.lock().await;
            let cursor = guard.get_or_insert_with(|| {
                let resume = self.start_block.map_or(head, |b| b.saturating_sub(1));
                info!(head, resume_after = resume, "sync cursor initialised");
                SyncCursor::new(resume)
            });
            cursor.update_head(head);
            cursor.drain_ranges(self.max_blocks)
        };

        let last = ranges.len().saturating_sub(1);
        for (i, range) in ranges.iter().enumerate() {
            let mut options = SendOptions::with_job_id(range.job_id());
            // The range at the tip jumps ahead of catch-up work.
            if i == last {
                options = options.with_priority(1);
            }
            let payload = serde_json::to_value(range).map_err(|e| {
                orderflow_jobs::BrokerError::Command(format!("failed to encode range: {e}"))
            })?;
            let outcome = self.queue.send(&self.descriptor, payload, options).await?;
            debug!(
                from = range.from_block,
                to = range.to_block,
                queued = outcome.is_queued(),
                "sync range sent"
            );
        }
        Ok(ranges)
    }

    /// Spawns the polling loop; it exits once `running` is cleared.
    pub fn spawn(self: Arc<Self>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "sync poller started");
            while running.load(Ordering::Relaxed) {
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "sync tick failed");
                }
                tokio::time::sleep(self.interval).await;
            }
            info!("sync poller stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use orderflow_jobs::{Broker, InMemoryBroker, InMemoryLockService};

    /// Log provider over a fixed set of logs and a movable head.
    #[derive(Default)]
    pub(crate) struct StaticLogs {
        pub(crate) logs: Vec<RawLog>,
        pub(crate) head: AtomicU64,
    }

    #[async_trait]
    impl LogProvider for StaticLogs {
        async fn get_logs(&self, range: &BlockRange) -> Result<Vec<RawLog>, TraceError> {
            Ok(self
                .logs
                .iter()
                .filter(|l| (range.from_block..=range.to_block).contains(&l.block_number))
                .cloned()
                .collect())
        }

        async fn block_number(&self) -> Result<u64, TraceError> {
            Ok(self.head.load(Ordering::Relaxed))
        }
    }

    fn poller(logs: Arc<StaticLogs>, start_block: Option<u64>) -> (Arc<InMemoryBroker>, SyncPoller) {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = JobQueue::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        );
        let mut config = IndexerConfig::default().with_max_blocks_per_sync(10);
        config.start_block = start_block;
        (broker, SyncPoller::new(logs, queue, &config))
    }

    #[tokio::test]
    async fn test_first_tick_starts_at_head() {
        let logs = Arc::new(StaticLogs::default());
        logs.head.store(500, Ordering::Relaxed);
        let (broker, poller) = poller(Arc::clone(&logs), None);

        let ranges = poller.tick().await.expect("tick");
        assert!(ranges.is_empty());
        assert_eq!(poller.last_synced().await, Some(500));

        logs.head.store(503, Ordering::Relaxed);
        let ranges = poller.tick().await.expect("tick");
        assert_eq!(ranges, vec![BlockRange::new(501, 503)]);
        assert_eq!(broker.len("events-sync-priority").await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_catch_up_from_start_block() {
        let logs = Arc::new(StaticLogs::default());
        logs.head.store(125, Ordering::Relaxed);
        let (broker, poller) = poller(logs, Some(101));

        let ranges = poller.tick().await.expect("tick");

        assert_eq!(
            ranges,
            vec![
                BlockRange::new(101, 110),
                BlockRange::new(111, 120),
                BlockRange::new(121, 125),
            ]
        );
        assert_eq!(broker.len("events-sync").await.expect("len"), 2);
        assert_eq!(broker.len("events-sync-priority").await.expect("len"), 1);
        assert_eq!(poller.last_synced().await, Some(125));
    }

    #[tokio::test]
    async fn test_head_unchanged_sends_nothing() {
        let logs = Arc::new(StaticLogs::default());
        logs.head.store(42, Ordering::Relaxed);
        let (broker, poller) = poller(logs, Some(40));

        assert_eq!(poller.tick().await.expect("tick").len(), 1);
        assert!(poller.tick().await.expect("tick").is_empty());
        assert_eq!(broker.len("events-sync-priority").await.expect("len"), 1);
    }
}
