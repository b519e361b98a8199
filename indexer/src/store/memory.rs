//! In-process order-book store.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    nonce_status, CollectionStats, FillabilityStatus, OrderBookStore, OrderRecord,
};
use crate::error::StoreError;
use crate::events::log::ProtocolKind;
use crate::events::types::{
    BulkCancelEvent, CancelEvent, FillEvent, FungibleTransfer, NonceInvalidation, OrderUpdate,
    Swap,
};

type LogKey = (B256, u64, u64);

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<B256, OrderRecord>,
    fills: HashMap<LogKey, FillEvent>,
    cancels: HashMap<LogKey, CancelEvent>,
    bulk_cancels: HashSet<LogKey>,
    master_nonces: HashMap<(ProtocolKind, Address), U256>,
    nonce_invalidations: HashMap<(ProtocolKind, Address, U256), bool>,
    transfers: HashMap<LogKey, FungibleTransfer>,
    swaps: HashMap<B256, Swap>,
    stats: HashMap<(Address, Option<U256>), CollectionStats>,
}

impl Inner {
    fn set_status(
        &mut self,
        id: B256,
        status: FillabilityStatus,
        position: (u64, u64),
    ) -> bool {
        match self.orders.get_mut(&id) {
            Some(order) if position > order.position() => {
                order.fillability_status = status;
                order.block_number = position.0;
                order.log_index = position.1;
                true
            }
            _ => false,
        }
    }

    fn matching_orders(
        &self,
        protocol: ProtocolKind,
        maker: Address,
        nonce_of: impl Fn(&OrderRecord) -> Option<U256>,
        predicate: impl Fn(U256) -> bool,
    ) -> Vec<B256> {
        let mut ids: Vec<B256> = self
            .orders
            .values()
            .filter(|o| o.protocol == protocol && o.maker == maker)
            .filter(|o| !o.fillability_status.is_terminal())
            .filter(|o| nonce_of(*o).is_some_and(&predicate))
            .map(|o| o.id)
            .collect();
        ids.sort();
        ids
    }
}

/// Order-book store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryOrderBookStore {
    inner: RwLock<Inner>,
}

impl InMemoryOrderBookStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored fills.
    pub async fn fill_count(&self) -> usize {
        self.inner.read().await.fills.len()
    }

    /// Number of stored fungible transfers.
    pub async fn transfer_count(&self) -> usize {
        self.inner.read().await.transfers.len()
    }

    /// Number of stored swaps.
    pub async fn swap_count(&self) -> usize {
        self.inner.read().await.swaps.len()
    }

    /// Returns every stored order, sorted by id.
    pub async fn orders(&self) -> Vec<OrderRecord> {
        let mut orders: Vec<_> = self.inner.read().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }
}

fn log_key(ctx: &crate::events::log::EventContext) -> LogKey {
    (ctx.tx_hash, ctx.log_index, ctx.batch_index)
}

#[async_trait]
impl OrderBookStore for InMemoryOrderBookStore {
    async fn insert_fills(&self, fills: &[FillEvent]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for fill in fills {
            if let std::collections::hash_map::Entry::Vacant(slot) =
                inner.fills.entry(log_key(&fill.ctx))
            {
                slot.insert(fill.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_cancels(&self, cancels: &[CancelEvent]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.cancels.len();
        for cancel in cancels {
            inner
                .cancels
                .entry(log_key(&cancel.ctx))
                .or_insert_with(|| cancel.clone());
        }
        Ok(inner.cancels.len() - before)
    }

    async fn apply_order_update(&self, update: &OrderUpdate) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.set_status(update.order_id(), update.into(), update.position()))
    }

    async fn apply_bulk_cancel(&self, event: &BulkCancelEvent) -> Result<Vec<B256>, StoreError> {
        let mut inner = self.inner.write().await;
        inner.bulk_cancels.insert(log_key(&event.ctx));

        let current = inner
            .master_nonces
            .entry((event.protocol, event.maker))
            .or_insert(U256::ZERO);
        *current = (*current).max(event.min_nonce);

        let position = event.ctx.position();
        let candidates = inner.matching_orders(
            event.protocol,
            event.maker,
            OrderRecord::bulk_cancel_nonce,
            |n| n < event.min_nonce,
        );
        Ok(candidates
            .into_iter()
            .filter(|id| inner.set_status(*id, FillabilityStatus::Cancelled, position))
            .collect())
    }

    async fn apply_nonce_invalidation(
        &self,
        event: &NonceInvalidation,
    ) -> Result<Vec<B256>, StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .nonce_invalidations
            .entry((event.protocol, event.maker, event.nonce))
            .or_insert(event.was_cancellation);

        let status = if event.was_cancellation {
            FillabilityStatus::Cancelled
        } else {
            FillabilityStatus::Filled
        };
        let position = event.ctx.position();
        let candidates = inner.matching_orders(
            event.protocol,
            event.maker,
            |o| o.nonce,
            |n| n == event.nonce,
        );
        Ok(candidates
            .into_iter()
            .filter(|id| inner.set_status(*id, status, position))
            .collect())
    }

    async fn insert_fungible_transfers(
        &self,
        transfers: &[FungibleTransfer],
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.transfers.len();
        for transfer in transfers {
            inner
                .transfers
                .entry(log_key(&transfer.ctx))
                .or_insert_with(|| transfer.clone());
        }
        Ok(inner.transfers.len() - before)
    }

    async fn insert_swaps(&self, swaps: &[Swap]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.swaps.len();
        for swap in swaps {
            inner
                .swaps
                .entry(swap.ctx.tx_hash)
                .or_insert_with(|| swap.clone());
        }
        Ok(inner.swaps.len() - before)
    }

    async fn master_nonce(
        &self,
        protocol: ProtocolKind,
        maker: Address,
    ) -> Result<U256, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .master_nonces
            .get(&(protocol, maker))
            .copied()
            .unwrap_or_default())
    }

    async fn find_order_id(
        &self,
        protocol: ProtocolKind,
        maker: Address,
        nonce: U256,
    ) -> Result<Option<B256>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .values()
            .filter(|o| o.protocol == protocol && o.maker == maker && o.nonce == Some(nonce))
            .map(|o| o.id)
            .min())
    }

    async fn get_order(&self, id: B256) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.inner.read().await.orders.get(&id).cloned())
    }

    async fn orders_by_maker(
        &self,
        maker: Address,
        contract: Option<Address>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|o| o.maker == maker && contract.is_none_or(|c| c == o.contract))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn upsert_order(&self, order: &OrderRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let newer = inner
            .orders
            .get(&order.id)
            .is_none_or(|existing| order.position() > existing.position());
        if !newer {
            return Ok(false);
        }
        inner.orders.insert(order.id, order.clone());
        Ok(true)
    }

    async fn revalidate_order(&self, id: B256) -> Result<Option<FillabilityStatus>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(order) = inner.orders.get(&id) else {
            return Ok(None);
        };
        let master = inner
            .master_nonces
            .get(&(order.protocol, order.maker))
            .copied()
            .unwrap_or_default();
        let invalidated = order.nonce.and_then(|nonce| {
            inner
                .nonce_invalidations
                .get(&(order.protocol, order.maker, nonce))
                .copied()
        });
        let current = order.fillability_status;
        match nonce_status(order, master, invalidated) {
            Some(status) => {
                if let Some(order) = inner.orders.get_mut(&id) {
                    order.fillability_status = status;
                }
                Ok(Some(status))
            }
            None => Ok(Some(current)),
        }
    }

    async fn recompute_collection(
        &self,
        contract: Address,
        token_id: Option<U256>,
    ) -> Result<CollectionStats, StoreError> {
        let mut inner = self.inner.write().await;
        let stats = CollectionStats::from_orders(contract, token_id, inner.orders.values());
        inner.stats.insert((contract, token_id), stats.clone());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::tests::ctx;
    use crate::events::types::OrderSide;
    use crate::store::tests::order;

    fn cancelled(id: u8, block: u64, log_index: u64) -> OrderUpdate {
        OrderUpdate::Cancelled {
            order_id: B256::repeat_byte(id),
            block_number: block,
            log_index,
        }
    }

    fn filled(id: u8, block: u64, log_index: u64) -> OrderUpdate {
        OrderUpdate::Filled {
            order_id: B256::repeat_byte(id),
            block_number: block,
            log_index,
        }
    }

    #[tokio::test]
    async fn test_recheck_keeps_newest_in_either_order() {
        for updates in [
            [cancelled(1, 10, 5), filled(1, 10, 3)],
            [filled(1, 10, 3), cancelled(1, 10, 5)],
        ] {
            let store = InMemoryOrderBookStore::new();
            store
                .upsert_order(&order(1, OrderSide::Sell, 100))
                .await
                .expect("upsert");
            for update in &updates {
                store.apply_order_update(update).await.expect("update");
            }
            let stored = store
                .get_order(B256::repeat_byte(1))
                .await
                .expect("get")
                .expect("order");
            assert_eq!(stored.position(), (10, 5));
            assert_eq!(stored.fillability_status, FillabilityStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_update_unknown_order_is_noop() {
        let store = InMemoryOrderBookStore::new();
        let applied = store
            .apply_order_update(&cancelled(7, 1, 1))
            .await
            .expect("update");
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_bulk_cancel_below_counter() {
        let store = InMemoryOrderBookStore::new();
        for (id, master) in [(1, 0), (2, 2), (3, 3)] {
            let mut record = order(id, OrderSide::Sell, 100);
            record.master_nonce = Some(U256::from(master));
            store.upsert_order(&record).await.expect("upsert");
        }
        let event = BulkCancelEvent {
            ctx: ctx(20, 0),
            protocol: ProtocolKind::PaymentProcessorV2,
            maker: Address::repeat_byte(0x11),
            min_nonce: U256::from(3),
        };

        let changed = store.apply_bulk_cancel(&event).await.expect("cancel");
        assert_eq!(changed, vec![B256::repeat_byte(1), B256::repeat_byte(2)]);

        let again = store.apply_bulk_cancel(&event).await.expect("cancel");
        assert!(again.is_empty());

        let lower = BulkCancelEvent {
            min_nonce: U256::from(1),
            ctx: ctx(21, 0),
            ..event
        };
        store.apply_bulk_cancel(&lower).await.expect("cancel");
        let nonce = store
            .master_nonce(ProtocolKind::PaymentProcessorV2, Address::repeat_byte(0x11))
            .await
            .expect("nonce");
        assert_eq!(nonce, U256::from(3));
    }

    #[tokio::test]
    async fn test_bulk_cancel_uses_master_nonce_not_order_nonce() {
        let store = InMemoryOrderBookStore::new();
        let mut stale = order(1, OrderSide::Sell, 100);
        stale.nonce = Some(U256::from(1000));
        stale.master_nonce = Some(U256::ZERO);
        let mut current = order(2, OrderSide::Sell, 100);
        current.nonce = Some(U256::ZERO);
        current.master_nonce = Some(U256::from(1));
        store.upsert_order(&stale).await.expect("upsert");
        store.upsert_order(&current).await.expect("upsert");

        let changed = store
            .apply_bulk_cancel(&BulkCancelEvent {
                ctx: ctx(20, 0),
                protocol: ProtocolKind::PaymentProcessorV2,
                maker: Address::repeat_byte(0x11),
                min_nonce: U256::from(1),
            })
            .await
            .expect("cancel");
        assert_eq!(changed, vec![B256::repeat_byte(1)]);

        let orders = store.orders().await;
        assert_eq!(orders[0].fillability_status, FillabilityStatus::Cancelled);
        assert_eq!(orders[1].fillability_status, FillabilityStatus::Fillable);

        // Revalidation reaches the same verdict from the stored counter.
        assert_eq!(
            store
                .revalidate_order(B256::repeat_byte(2))
                .await
                .expect("revalidate"),
            Some(FillabilityStatus::Fillable)
        );
    }

    #[tokio::test]
    async fn test_nonce_invalidation_and_revalidate() {
        let store = InMemoryOrderBookStore::new();
        store
            .upsert_order(&order(2, OrderSide::Sell, 100))
            .await
            .expect("upsert");
        store
            .upsert_order(&order(4, OrderSide::Buy, 50))
            .await
            .expect("upsert");

        let event = NonceInvalidation {
            ctx: ctx(5, 1),
            protocol: ProtocolKind::PaymentProcessorV2,
            maker: Address::repeat_byte(0x11),
            nonce: U256::from(2),
            was_cancellation: true,
        };
        let changed = store.apply_nonce_invalidation(&event).await.expect("apply");
        assert_eq!(changed, vec![B256::repeat_byte(2)]);

        let found = store
            .find_order_id(
                ProtocolKind::PaymentProcessorV2,
                Address::repeat_byte(0x11),
                U256::from(4),
            )
            .await
            .expect("find");
        assert_eq!(found, Some(B256::repeat_byte(4)));

        let status = store
            .revalidate_order(B256::repeat_byte(4))
            .await
            .expect("revalidate");
        assert_eq!(status, Some(FillabilityStatus::Fillable));
        assert_eq!(
            store.revalidate_order(B256::ZERO).await.expect("revalidate"),
            None
        );
    }
}
