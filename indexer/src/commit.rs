//! Commit stage.
//!
//! Persists one batch of mutation records, then enqueues the follow-on jobs.
//! Every write is an idempotent upsert and every order status change goes
//! through the `(block, log index)` recheck condition, so replaying a batch
//! or committing overlapping batches in any order converges.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use orderflow_jobs::{JobQueue, QueueDescriptor, SendOptions};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::IndexerError;
use crate::events::accumulator::OnChainData;
use crate::events::log::EventContext;
use crate::events::types::OrderUpdate;
use crate::jobs::{queues, CollectionRecomputePayload, OrderUpdatePayload};
use crate::store::OrderBookStore;

/// Counts of what one commit wrote and enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    /// New fill rows.
    pub fills: usize,
    /// New cancellation rows.
    pub cancels: usize,
    /// Orders whose status changed.
    pub orders_updated: usize,
    /// New fungible transfer rows.
    pub transfers: usize,
    /// New swap rows.
    pub swaps: usize,
    /// Follow-on jobs published.
    pub jobs_enqueued: usize,
    /// Follow-on jobs collapsed into a pending one.
    pub jobs_deduplicated: usize,
}

/// Persists batches and schedules follow-on work.
pub struct CommitStage {
    store: Arc<dyn OrderBookStore>,
    queue: JobQueue,
    order_updates: QueueDescriptor,
    collection_recompute: QueueDescriptor,
}

impl CommitStage {
    /// Creates a commit stage.
    #[must_use]
    pub fn new(store: Arc<dyn OrderBookStore>, queue: JobQueue) -> Self {
        Self {
            store,
            queue,
            order_updates: queues::order_updates(),
            collection_recompute: queues::collection_recompute(),
        }
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderBookStore> {
        &self.store
    }

    async fn apply_updates(
        &self,
        updates: impl Iterator<Item = OrderUpdate>,
    ) -> Result<usize, IndexerError> {
        let mut changed = 0;
        for update in updates {
            if self.store.apply_order_update(&update).await? {
                changed += 1;
            } else {
                debug!(order = %update.order_id(), position = ?update.position(), "order update not applied");
            }
        }
        Ok(changed)
    }

    /// Persists `data` and enqueues the follow-on jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if a store write or a publish fails. Everything
    /// written before the failure stays written; a retry converges.
    pub async fn commit(&self, data: &OnChainData) -> Result<CommitSummary, IndexerError> {
        let mut summary = CommitSummary::default();
        let mut revalidate: Vec<(B256, String)> = Vec::new();

        summary.fills = self.store.insert_fills(&data.fill_events).await?;
        summary.orders_updated += self
            .apply_updates(data.fill_events.iter().filter_map(|f| f.order_update()))
            .await?;

        summary.cancels = self.store.insert_cancels(&data.cancel_events).await?;
        summary.orders_updated += self
            .apply_updates(data.cancel_events.iter().map(OrderUpdate::from))
            .await?;

        for event in &data.bulk_cancel_events {
            let ids = self.store.apply_bulk_cancel(event).await?;
            summary.orders_updated += ids.len();
            revalidate.extend(ids.into_iter().map(|id| (id, position_context(&event.ctx))));
        }

        for event in &data.nonce_invalidations {
            let ids = self.store.apply_nonce_invalidation(event).await?;
            summary.orders_updated += ids.len();
            revalidate.extend(ids.into_iter().map(|id| (id, position_context(&event.ctx))));
        }

        summary.transfers = self
            .store
            .insert_fungible_transfers(&data.fungible_transfers)
            .await?;
        summary.swaps = self.store.insert_swaps(&data.swaps).await?;

        self.enqueue_follow_ups(data, revalidate, &mut summary).await?;

        info!(
            fills = summary.fills,
            cancels = summary.cancels,
            orders_updated = summary.orders_updated,
            transfers = summary.transfers,
            swaps = summary.swaps,
            jobs = summary.jobs_enqueued,
            deduplicated = summary.jobs_deduplicated,
            "committed batch"
        );
        Ok(summary)
    }

    async fn enqueue_follow_ups(
        &self,
        data: &OnChainData,
        revalidate: Vec<(B256, String)>,
        summary: &mut CommitSummary,
    ) -> Result<(), IndexerError> {
        let mut seen: HashSet<String> = HashSet::new();

        let order_jobs = data
            .order_triggers
            .iter()
            .map(|t| (t.order_id, t.context.clone()))
            .chain(revalidate);
        for (order_id, context) in order_jobs {
            let job_id = format!("{order_id}-{context}");
            if !seen.insert(job_id.clone()) {
                continue;
            }
            let payload = OrderUpdatePayload::Order { order_id, context };
            self.send(&self.order_updates, &payload, job_id, summary).await?;
        }

        for trigger in data.maker_state_triggers() {
            let context = trigger.context_id();
            if !seen.insert(context.clone()) {
                continue;
            }
            let payload = OrderUpdatePayload::MakerState {
                maker: trigger.maker,
                contract: trigger.contract,
                trigger: trigger.kind,
                context: context.clone(),
            };
            self.send(&self.order_updates, &payload, context, summary).await?;
        }

        let collections: BTreeSet<(Address, U256, B256)> = data
            .fill_events
            .iter()
            .map(|f| (f.contract, f.token_id, f.ctx.tx_hash))
            .collect();
        for (contract, token_id, tx_hash) in collections {
            let context = tx_hash.to_string();
            let job_id = format!("{contract}-{token_id}-{context}");
            let payload = CollectionRecomputePayload {
                contract,
                token_id: Some(token_id),
                context,
            };
            self.send(&self.collection_recompute, &payload, job_id, summary)
                .await?;
        }
        Ok(())
    }

    async fn send(
        &self,
        descriptor: &QueueDescriptor,
        payload: &impl Serialize,
        job_id: String,
        summary: &mut CommitSummary,
    ) -> Result<(), IndexerError> {
        let value = serde_json::to_value(payload).map_err(|e| {
            orderflow_jobs::BrokerError::Command(format!("failed to encode payload: {e}"))
        })?;
        let outcome = self
            .queue
            .send(descriptor, value, SendOptions::with_job_id(job_id))
            .await?;
        if outcome.is_queued() {
            summary.jobs_enqueued += 1;
        } else {
            summary.jobs_deduplicated += 1;
        }
        Ok(())
    }
}

fn position_context(ctx: &EventContext) -> String {
    format!("{}-{}-{}", ctx.tx_hash, ctx.log_index, ctx.batch_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::log::ProtocolKind;
    use crate::events::types::tests::ctx;
    use crate::events::types::{CancelEvent, FillEvent, MakerStateTrigger, OrderSide, TriggerKind};
    use crate::handlers::order_trigger;
    use crate::store::tests::order;
    use crate::store::{FillabilityStatus, InMemoryOrderBookStore};
    use orderflow_jobs::{Broker, InMemoryBroker, InMemoryLockService};

    fn stage() -> (Arc<InMemoryOrderBookStore>, Arc<InMemoryBroker>, CommitStage) {
        let store = Arc::new(InMemoryOrderBookStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let queue = JobQueue::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(InMemoryLockService::new()),
        );
        let stage = CommitStage::new(Arc::clone(&store) as Arc<dyn OrderBookStore>, queue);
        (store, broker, stage)
    }

    fn fill(order_id: B256, block: u64, log_index: u64) -> FillEvent {
        FillEvent {
            ctx: ctx(block, log_index),
            protocol: ProtocolKind::PaymentProcessorV2,
            order_id: Some(order_id),
            side: OrderSide::Sell,
            maker: Address::repeat_byte(0x11),
            taker: Address::repeat_byte(0x22),
            contract: Address::repeat_byte(0xcc),
            token_id: U256::from(5),
            amount: U256::from(1),
            price: U256::from(100),
            currency: Address::ZERO,
        }
    }

    fn batch() -> OnChainData {
        let id = B256::repeat_byte(1);
        let mut data = OnChainData::new();
        data.fill_events.push(fill(id, 10, 3));
        data.order_triggers.push(order_trigger(ctx(10, 3), id));
        data.add_maker_trigger(MakerStateTrigger {
            ctx: ctx(10, 4),
            maker: Address::repeat_byte(0x22),
            contract: Address::repeat_byte(0x77),
            kind: TriggerKind::Balance,
            operator: None,
        });
        data
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let (store, broker, stage) = stage();
        store
            .upsert_order(&order(1, OrderSide::Sell, 100))
            .await
            .expect("seed");

        let first = stage.commit(&batch()).await.expect("first commit");
        assert_eq!(first.fills, 1);
        assert_eq!(first.orders_updated, 1);
        assert_eq!(first.jobs_enqueued, 3);

        let second = stage.commit(&batch()).await.expect("second commit");
        assert_eq!(second.fills, 0);
        assert_eq!(second.orders_updated, 0);
        assert_eq!(second.jobs_enqueued, 0);
        assert_eq!(second.jobs_deduplicated, 3);

        assert_eq!(store.fill_count().await, 1);
        assert_eq!(broker.len("order-updates").await.expect("len"), 2);
        assert_eq!(broker.len("collection-recompute").await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_later_cancel_wins_over_earlier_fill() {
        let (store, _broker, stage) = stage();
        let id = B256::repeat_byte(1);
        store
            .upsert_order(&order(1, OrderSide::Sell, 100))
            .await
            .expect("seed");

        let mut later = OnChainData::new();
        later.cancel_events.push(CancelEvent {
            ctx: ctx(10, 5),
            protocol: ProtocolKind::PaymentProcessorV2,
            order_id: id,
            maker: Address::repeat_byte(0x11),
        });
        stage.commit(&later).await.expect("cancel batch");

        let mut earlier = OnChainData::new();
        earlier.fill_events.push(fill(id, 10, 3));
        let summary = stage.commit(&earlier).await.expect("fill batch");

        assert_eq!(summary.fills, 1);
        assert_eq!(summary.orders_updated, 0);
        let stored = store.get_order(id).await.expect("get").expect("order");
        assert_eq!(stored.fillability_status, FillabilityStatus::Cancelled);
        assert_eq!(stored.position(), (10, 5));
    }

    #[tokio::test]
    async fn test_nonce_invalidation_schedules_revalidation() {
        let (store, broker, stage) = stage();
        store
            .upsert_order(&order(7, OrderSide::Sell, 100))
            .await
            .expect("seed");

        let mut data = OnChainData::new();
        data.nonce_invalidations.push(crate::events::types::NonceInvalidation {
            ctx: ctx(20, 0),
            protocol: ProtocolKind::PaymentProcessorV2,
            maker: Address::repeat_byte(0x11),
            nonce: U256::from(7),
            was_cancellation: true,
        });
        let summary = stage.commit(&data).await.expect("commit");

        assert_eq!(summary.orders_updated, 1);
        assert_eq!(summary.jobs_enqueued, 1);
        assert_eq!(broker.len("order-updates").await.expect("len"), 1);
    }
}
