//! Indexer job handlers.
//!
//! Four queues run on the job runtime:
//!
//! - `events-sync`: a realtime block range through fetch, process, commit
//! - `events-sync-backfill`: the same pipeline for historical ranges
//! - `order-updates`: revalidates one order, or a maker's orders on a contract
//! - `collection-recompute`: refreshes floor ask and top bid
//!
//! Payloads carry identifiers only; handlers re-read state from the store.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use orderflow_jobs::{
    decode_payload, JobError, JobHandler, JobMessage, JobQueue, QueueDescriptor, SendOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::commit::CommitStage;
use crate::error::IndexerError;
use crate::events::cursor::BlockRange;
use crate::events::processor::EventProcessor;
use crate::events::types::TriggerKind;
use crate::store::OrderBookStore;
use crate::sync::LogProvider;

/// Queue declarations.
pub mod queues {
    use std::time::Duration;

    use orderflow_jobs::{Backoff, QueueDescriptor};

    /// Realtime sync queue.
    pub const EVENTS_SYNC: &str = "events-sync";
    /// Historical sync queue.
    pub const EVENTS_SYNC_BACKFILL: &str = "events-sync-backfill";
    /// Order revalidation queue.
    pub const ORDER_UPDATES: &str = "order-updates";
    /// Collection stats queue.
    pub const COLLECTION_RECOMPUTE: &str = "collection-recompute";

    /// Realtime ranges: high retry budget, tip ranges on the priority queue.
    #[must_use]
    pub fn events_sync() -> QueueDescriptor {
        QueueDescriptor::new(EVENTS_SYNC)
            .with_max_retries(10)
            .with_concurrency(5)
            .with_timeout(Duration::from_secs(120))
            .with_backoff(Backoff::Exponential(5000))
            .with_priority_queue()
    }

    #[must_use]
    pub fn events_sync_backfill() -> QueueDescriptor {
        QueueDescriptor::new(EVENTS_SYNC_BACKFILL)
            .with_max_retries(10)
            .with_concurrency(1)
            .with_timeout(Duration::from_secs(600))
            .with_backoff(Backoff::Exponential(10_000))
            .with_dead_letter_sweep(Duration::from_secs(3600))
    }

    #[must_use]
    pub fn order_updates() -> QueueDescriptor {
        QueueDescriptor::new(ORDER_UPDATES)
            .with_concurrency(10)
            .with_timeout(Duration::from_secs(30))
            .with_backoff(Backoff::Fixed(1000))
    }

    #[must_use]
    pub fn collection_recompute() -> QueueDescriptor {
        QueueDescriptor::new(COLLECTION_RECOMPUTE)
            .with_concurrency(2)
            .with_timeout(Duration::from_secs(60))
            .with_backoff(Backoff::Exponential(2000))
    }
}

/// Payload of an `order-updates` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OrderUpdatePayload {
    /// Revalidate one order.
    Order {
        /// Order hash.
        order_id: B256,
        /// Dedup context.
        context: String,
    },

    /// Revalidate a maker's orders on one contract.
    MakerState {
        /// Maker.
        maker: Address,
        /// Token contract whose state changed.
        contract: Address,
        /// Balance or approval.
        trigger: TriggerKind,
        /// Dedup context.
        context: String,
    },
}

/// Payload of a `collection-recompute` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRecomputePayload {
    /// NFT contract.
    pub contract: Address,
    /// Token, or `None` for the whole collection.
    #[serde(default)]
    pub token_id: Option<U256>,
    /// Dedup context.
    pub context: String,
}

/// Fetches, processes and commits one block range.
pub struct EventsSyncJob {
    descriptor: QueueDescriptor,
    logs: Arc<dyn LogProvider>,
    processor: Arc<EventProcessor>,
    commit: Arc<CommitStage>,
}

impl EventsSyncJob {
    /// Creates the realtime handler.
    #[must_use]
    pub fn realtime(
        logs: Arc<dyn LogProvider>,
        processor: Arc<EventProcessor>,
        commit: Arc<CommitStage>,
    ) -> Self {
        Self {
            descriptor: queues::events_sync(),
            logs,
            processor,
            commit,
        }
    }

    /// Creates the backfill handler.
    #[must_use]
    pub fn backfill(
        logs: Arc<dyn LogProvider>,
        processor: Arc<EventProcessor>,
        commit: Arc<CommitStage>,
    ) -> Self {
        Self {
            descriptor: queues::events_sync_backfill(),
            ..Self::realtime(logs, processor, commit)
        }
    }

    async fn sync(&self, range: BlockRange) -> Result<Value, IndexerError> {
        let logs = self.logs.get_logs(&range).await?;
        let log_count = logs.len();
        let outcome = self.processor.process(logs).await;

        // Whatever succeeded is committed even when an arm failed; the retry
        // replays the range and the writes converge.
        let summary = self.commit.commit(&outcome.data).await?;

        if !outcome.is_complete() {
            let failed: Vec<&str> = outcome.failed.iter().map(|p| p.as_str()).collect();
            return Err(IndexerError::PartialBatch(failed.join(",")));
        }

        info!(
            queue = %self.descriptor.queue_name(),
            from = range.from_block,
            to = range.to_block,
            logs = log_count,
            "synced block range"
        );
        Ok(json!({
            "fromBlock": range.from_block,
            "toBlock": range.to_block,
            "logs": log_count,
            "summary": summary,
        }))
    }
}

#[async_trait]
impl JobHandler for EventsSyncJob {
    fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    async fn process(&self, payload: &Value) -> Result<Value, JobError> {
        let range: BlockRange = decode_payload(payload)?;
        if range.is_empty() {
            warn!(from = range.from_block, to = range.to_block, "ignoring inverted block range");
            return Ok(Value::Null);
        }
        Ok(self.sync(range).await?)
    }

    async fn on_error(&self, message: &JobMessage, error: &JobError) -> Result<(), JobError> {
        warn!(
            queue = %self.descriptor.queue_name(),
            job_id = ?message.job_id,
            retry_count = message.retry_count,
            error = %error,
            "block range failed"
        );
        Ok(())
    }
}

/// Revalidates orders after an on-chain state change.
pub struct OrderUpdatesJob {
    descriptor: QueueDescriptor,
    store: Arc<dyn OrderBookStore>,
    queue: JobQueue,
    collection_recompute: QueueDescriptor,
}

impl OrderUpdatesJob {
    /// Creates the handler.
    #[must_use]
    pub fn new(store: Arc<dyn OrderBookStore>, queue: JobQueue) -> Self {
        Self {
            descriptor: queues::order_updates(),
            store,
            queue,
            collection_recompute: queues::collection_recompute(),
        }
    }

    /// Revalidates one order; returns its contract and token if the status
    /// changed.
    async fn revalidate(&self, id: B256) -> Result<Option<(Address, U256)>, IndexerError> {
        let Some(before) = self.store.get_order(id).await? else {
            debug!(order = %id, "order not indexed, nothing to revalidate");
            return Ok(None);
        };
        let after = self.store.revalidate_order(id).await?;
        match after {
            Some(status) if status != before.fillability_status => {
                info!(
                    order = %id,
                    from = before.fillability_status.as_str(),
                    to = status.as_str(),
                    "order status changed"
                );
                Ok(Some((before.contract, before.token_id)))
            }
            _ => Ok(None),
        }
    }

    async fn schedule_recompute(
        &self,
        contract: Address,
        token_id: U256,
        context: &str,
    ) -> Result<(), IndexerError> {
        let payload = CollectionRecomputePayload {
            contract,
            token_id: Some(token_id),
            context: context.to_string(),
        };
        let value = serde_json::to_value(&payload).map_err(|e| {
            orderflow_jobs::BrokerError::Command(format!("failed to encode payload: {e}"))
        })?;
        let job_id = format!("{contract}-{token_id}-{context}");
        self.queue
            .send(&self.collection_recompute, value, SendOptions::with_job_id(job_id))
            .await?;
        Ok(())
    }

    async fn run(&self, payload: OrderUpdatePayload) -> Result<Value, IndexerError> {
        let (ids, context) = match payload {
            OrderUpdatePayload::Order { order_id, context } => (vec![order_id], context),
            OrderUpdatePayload::MakerState {
                maker,
                contract,
                trigger,
                context,
            } => {
                let orders = self.store.orders_by_maker(maker, Some(contract)).await?;
                debug!(
                    maker = %maker,
                    contract = %contract,
                    trigger = %trigger,
                    orders = orders.len(),
                    "revalidating maker orders"
                );
                (orders.into_iter().map(|o| o.id).collect(), context)
            }
        };

        let mut changed = 0_usize;
        for id in &ids {
            if let Some((contract, token_id)) = self.revalidate(*id).await? {
                changed += 1;
                self.schedule_recompute(contract, token_id, &context).await?;
            }
        }
        Ok(json!({ "orders": ids.len(), "changed": changed }))
    }
}

#[async_trait]
impl JobHandler for OrderUpdatesJob {
    fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    async fn process(&self, payload: &Value) -> Result<Value, JobError> {
        let payload: OrderUpdatePayload = decode_payload(payload)?;
        Ok(self.run(payload).await?)
    }
}

/// Refreshes floor ask and top bid of a collection or token.
pub struct CollectionRecomputeJob {
    descriptor: QueueDescriptor,
    store: Arc<dyn OrderBookStore>,
}

impl CollectionRecomputeJob {
    /// Creates the handler.
    #[must_use]
    pub fn new(store: Arc<dyn OrderBookStore>) -> Self {
        Self {
            descriptor: queues::collection_recompute(),
            store,
        }
    }
}

#[async_trait]
impl JobHandler for CollectionRecomputeJob {
    fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    async fn process(&self, payload: &Value) -> Result<Value, JobError> {
        let payload: CollectionRecomputePayload = decode_payload(payload)?;
        let stats = self
            .store
            .recompute_collection(payload.contract, payload.token_id)
            .await
            .map_err(IndexerError::from)?;
        debug!(
            contract = %stats.contract,
            token_id = ?stats.token_id,
            floor_ask = ?stats.floor_ask,
            top_bid = ?stats.top_bid,
            "recomputed collection"
        );
        serde_json::to_value(&stats).map_err(JobError::InvalidPayload)
    }
}
