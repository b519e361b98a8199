//! Indexer service.
//!
//! Wires the chain providers, the order-book store and the job backends into
//! the job runtime, and drives the sync poller next to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use orderflow_jobs::{
    create_pool, Broker, HandlerRegistry, JobQueue, JobRuntime, LockService, RedisBroker,
    RedisLockService, RuntimeConfig, SendOptions,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::commit::CommitStage;
use crate::config::{ConfigError, IndexerConfig};
use crate::error::{IndexerError, StoreError, TraceError};
use crate::events::classifier::LogClassifier;
use crate::events::cursor::{BlockRange, SyncCursor};
use crate::events::metrics::EventMetrics;
use crate::events::processor::EventProcessor;
use crate::handlers::{
    Erc20Handler, Erc721Handler, PaymentProcessorHandler, ProtocolDispatch, SeaportHandler,
};
use crate::jobs::{queues, CollectionRecomputeJob, EventsSyncJob, OrderUpdatesJob};
use crate::reconciler::Reconciler;
use crate::rpc::JsonRpcClient;
use crate::store::{OrderBookStore, PgOrderBookStore};
use crate::swap::TransactionProvider;
use crate::sync::{LogProvider, SyncPoller};
use crate::trace::TraceProvider;

/// Errors raised while assembling the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Indexer configuration error.
    #[error("indexer config: {0}")]
    Config(#[from] ConfigError),

    /// Job runtime configuration error.
    #[error("job runtime config: {0}")]
    Runtime(#[from] orderflow_jobs::ConfigError),

    /// Duplicate queue registration.
    #[error(transparent)]
    Registry(#[from] orderflow_jobs::RegistryError),

    /// Broker connection error.
    #[error(transparent)]
    Broker(#[from] orderflow_jobs::BrokerError),

    /// Store connection or migration error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// RPC client error.
    #[error(transparent)]
    Rpc(#[from] TraceError),

    /// Pipeline error.
    #[error(transparent)]
    Indexer(#[from] IndexerError),
}

/// The chain-facing providers.
#[derive(Clone)]
pub struct ChainProviders {
    /// Log source.
    pub logs: Arc<dyn LogProvider>,
    /// Call trace source.
    pub traces: Arc<dyn TraceProvider>,
    /// Transaction source.
    pub transactions: Arc<dyn TransactionProvider>,
}

impl ChainProviders {
    /// Serves every provider from one JSON-RPC client.
    #[must_use]
    pub fn from_client(client: Arc<JsonRpcClient>) -> Self {
        Self {
            logs: Arc::clone(&client) as Arc<dyn LogProvider>,
            traces: Arc::clone(&client) as Arc<dyn TraceProvider>,
            transactions: client,
        }
    }
}

/// The assembled indexer.
pub struct IndexerService {
    config: IndexerConfig,
    runtime: JobRuntime,
    poller: Arc<SyncPoller>,
    metrics: Arc<EventMetrics>,
    running: Arc<AtomicBool>,
}

impl IndexerService {
    /// Assembles the service over the given providers and backends.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration is invalid.
    pub fn new(
        config: IndexerConfig,
        runtime_config: RuntimeConfig,
        providers: ChainProviders,
        store: Arc<dyn OrderBookStore>,
        broker: Arc<dyn Broker>,
        locks: Arc<dyn LockService>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let metrics = Arc::new(EventMetrics::new());
        let queue = JobQueue::new(Arc::clone(&broker), Arc::clone(&locks));

        let reconciler = Arc::new(Reconciler::new(
            config.addresses.payment_processor,
            config.chain_id,
            config.nonce_lookback,
            Arc::clone(&store),
        ));
        let dispatch = ProtocolDispatch::new()
            .with(Arc::new(SeaportHandler::new()))
            .with(Arc::new(PaymentProcessorHandler::new(
                reconciler,
                Arc::clone(&providers.traces),
                Arc::clone(&metrics),
            )))
            .with(Arc::new(Erc20Handler::new(
                Arc::clone(&providers.transactions),
                config.relay_solver_set(),
            )))
            .with(Arc::new(Erc721Handler::new()));

        let classifier = Arc::new(LogClassifier::with_protocols(&config.addresses));
        let processor =
            Arc::new(EventProcessor::new(classifier, dispatch).with_metrics(Arc::clone(&metrics)));
        let commit = Arc::new(CommitStage::new(Arc::clone(&store), queue.clone()));

        let registry = HandlerRegistry::new()
            .with(Arc::new(EventsSyncJob::realtime(
                Arc::clone(&providers.logs),
                Arc::clone(&processor),
                Arc::clone(&commit),
            )))?
            .with(Arc::new(EventsSyncJob::backfill(
                Arc::clone(&providers.logs),
                processor,
                commit,
            )))?
            .with(Arc::new(OrderUpdatesJob::new(Arc::clone(&store), queue.clone())))?
            .with(Arc::new(CollectionRecomputeJob::new(store)))?;

        let runtime = JobRuntime::new(Arc::new(registry), broker, locks, runtime_config)?;
        let poller = Arc::new(SyncPoller::new(providers.logs, runtime.queue(), &config));

        Ok(Self {
            config,
            runtime,
            poller,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Connects the production backends: JSON-RPC, Postgres and Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be reached or migrated.
    pub async fn connect(
        config: IndexerConfig,
        runtime_config: RuntimeConfig,
    ) -> Result<Self, ServiceError> {
        let classifier = LogClassifier::with_protocols(&config.addresses);
        let client = Arc::new(
            JsonRpcClient::new(config.rpc_url.clone())?.with_topic_filter(classifier.signatures()),
        );

        let store =
            PgOrderBookStore::connect(&config.database_url, config.database_max_connections)
                .await?;
        store.migrate().await?;
        info!("Order-book store ready");

        let pool = create_pool(&runtime_config.redis_url)?;
        let broker = Arc::new(RedisBroker::new(pool.clone(), runtime_config.key_prefix.clone()));
        let locks = Arc::new(RedisLockService::new(
            pool,
            runtime_config.key_prefix.clone(),
            runtime_config.instance_id.clone(),
        ));

        Self::new(
            config,
            runtime_config,
            ChainProviders::from_client(client),
            Arc::new(store),
            broker,
            locks,
        )
    }

    /// Returns the event metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<EventMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the job runtime.
    #[must_use]
    pub const fn runtime(&self) -> &JobRuntime {
        &self.runtime
    }

    /// Returns the sync poller.
    #[must_use]
    pub fn poller(&self) -> Arc<SyncPoller> {
        Arc::clone(&self.poller)
    }

    /// Returns true if the service is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Splits `range` into sync-sized chunks on the backfill queue.
    ///
    /// # Errors
    ///
    /// Returns an error if a publish fails.
    pub async fn backfill(&self, range: BlockRange) -> Result<usize, IndexerError> {
        let mut cursor = SyncCursor::new(range.from_block.saturating_sub(1));
        cursor.update_head(range.to_block);
        let chunks = cursor.drain_ranges(self.config.max_blocks_per_sync);

        let queue = self.runtime.queue();
        let descriptor = queues::events_sync_backfill();
        let mut queued = 0;
        for chunk in &chunks {
            let payload = serde_json::to_value(chunk).map_err(|e| {
                orderflow_jobs::BrokerError::Command(format!("failed to encode range: {e}"))
            })?;
            let outcome = queue
                .send(&descriptor, payload, SendOptions::with_job_id(chunk.job_id()))
                .await?;
            if outcome.is_queued() {
                queued += 1;
            }
        }
        info!(
            from = range.from_block,
            to = range.to_block,
            chunks = chunks.len(),
            queued,
            "Backfill scheduled"
        );
        Ok(queued)
    }

    /// Starts the job workers and the sync poller.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured backfill cannot be scheduled.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, ServiceError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        if let Some(range) = self.config.backfill {
            self.backfill(range).await?;
        }

        let mut tasks = self.runtime.start();
        tasks.push(Arc::clone(&self.poller).spawn(Arc::clone(&self.running)));
        info!(
            chain_id = self.config.chain_id,
            queues = self.runtime.registry().len(),
            "Indexer service started"
        );
        Ok(tasks)
    }

    /// Stops the poller and the job workers after their current work.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.runtime.stop();
        info!("Indexer service stop requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{StaticTraces, StaticTransactions};
    use crate::store::InMemoryOrderBookStore;
    use crate::sync::tests::StaticLogs;
    use orderflow_jobs::{InMemoryBroker, InMemoryLockService};

    fn service(config: IndexerConfig) -> (Arc<InMemoryBroker>, IndexerService) {
        let broker = Arc::new(InMemoryBroker::new());
        let providers = ChainProviders {
            logs: Arc::new(StaticLogs::default()),
            traces: Arc::new(StaticTraces::default()),
            transactions: Arc::new(StaticTransactions::default()),
        };
        let service = IndexerService::new(
            config,
            RuntimeConfig::default(),
            providers,
            Arc::new(InMemoryOrderBookStore::new()),
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        )
        .expect("service");
        (broker, service)
    }

    #[test]
    fn test_registers_every_queue() {
        let (_broker, service) = service(IndexerConfig::default());
        let mut names = service.runtime().registry().queue_names();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "collection-recompute",
                "events-sync",
                "events-sync-backfill",
                "order-updates"
            ]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = IndexerService::new(
            IndexerConfig::default().with_nonce_lookback(0),
            RuntimeConfig::default(),
            ChainProviders {
                logs: Arc::new(StaticLogs::default()),
                traces: Arc::new(StaticTraces::default()),
                transactions: Arc::new(StaticTransactions::default()),
            },
            Arc::new(InMemoryOrderBookStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryLockService::new()),
        );
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_backfill_chunks_and_dedups() {
        let (broker, service) = service(IndexerConfig::default().with_max_blocks_per_sync(10));

        let queued = service
            .backfill(BlockRange::new(100, 125))
            .await
            .expect("backfill");
        assert_eq!(queued, 3);
        assert_eq!(broker.len("events-sync-backfill").await.expect("len"), 3);

        let again = service
            .backfill(BlockRange::new(100, 125))
            .await
            .expect("backfill");
        assert_eq!(again, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let mut config = IndexerConfig::default();
        config.backfill = Some(BlockRange::new(1, 5));
        let (broker, service) = service(config);

        let tasks = service.start().await.expect("start");
        assert!(service.is_running());
        assert!(!tasks.is_empty());
        assert!(service.start().await.expect("second start").is_empty());

        service.stop();
        for task in tasks {
            task.await.expect("join");
        }
        assert!(!service.is_running());
        // The backfill range was either still queued or consumed by a worker.
        let pending = broker.len("events-sync-backfill").await.expect("len");
        assert!(pending <= 1);
    }
}
