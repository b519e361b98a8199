//! Order-book persistence.
//!
//! Every write is idempotent: event rows are keyed on their log position and
//! order rows only move forward under the recheck condition, which accepts a
//! change only when its `(block_number, log_index)` is strictly greater than
//! the stored one.
//!
//! # Components
//!
//! - [`memory`]: In-process store for tests and local runs
//! - [`postgres`]: sqlx/Postgres store

pub mod memory;
pub mod postgres;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::events::log::ProtocolKind;
use crate::events::types::{
    BulkCancelEvent, CancelEvent, FillEvent, FungibleTransfer, NonceInvalidation, OrderSide,
    OrderUpdate, Swap,
};

pub use memory::InMemoryOrderBookStore;
pub use postgres::PgOrderBookStore;

/// Whether an order can still be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillabilityStatus {
    /// Live.
    Fillable,
    /// Filled on chain.
    Filled,
    /// Cancelled on chain.
    Cancelled,
    /// Maker lacks the balance to honour it.
    NoBalance,
}

impl FillabilityStatus {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fillable => "fillable",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::NoBalance => "no-balance",
        }
    }

    /// Parses the stored name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fillable" => Some(Self::Fillable),
            "filled" => Some(Self::Filled),
            "cancelled" => Some(Self::Cancelled),
            "no-balance" => Some(Self::NoBalance),
            _ => None,
        }
    }

    /// Returns true if the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

impl From<&OrderUpdate> for FillabilityStatus {
    fn from(update: &OrderUpdate) -> Self {
        match update {
            OrderUpdate::Filled { .. } => Self::Filled,
            OrderUpdate::Cancelled { .. } => Self::Cancelled,
        }
    }
}

/// Whether the maker's approvals cover an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    /// The exchange may move the maker's assets.
    Approved,
    /// Approval was revoked.
    NoApproval,
}

impl ApprovalStatus {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::NoApproval => "no-approval",
        }
    }

    /// Parses the stored name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "no-approval" => Some(Self::NoApproval),
            _ => None,
        }
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    /// Order hash.
    pub id: B256,
    /// Exchange protocol.
    pub protocol: ProtocolKind,
    /// Listing or bid.
    pub side: OrderSide,
    /// Order maker.
    pub maker: Address,
    /// NFT contract.
    pub contract: Address,
    /// NFT token id.
    pub token_id: U256,
    /// Exchange nonce or counter the order was signed with.
    pub nonce: Option<U256>,
    /// Master nonce a Payment Processor order was signed under.
    #[serde(default)]
    pub master_nonce: Option<U256>,
    /// Price.
    pub price: U256,
    /// Payment currency.
    pub currency: Address,
    /// Fillability.
    pub fillability_status: FillabilityStatus,
    /// Approval.
    pub approval_status: ApprovalStatus,
    /// Block of the last accepted change.
    pub block_number: u64,
    /// Log index of the last accepted change.
    pub log_index: u64,
}

impl OrderRecord {
    /// Returns the recheck position.
    #[must_use]
    pub const fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Value a bulk cancel compares against the maker's new counter.
    ///
    /// Payment Processor bulk cancels raise the master nonce, which is
    /// independent of the per-order nonce. Seaport signs orders with the
    /// counter itself.
    #[must_use]
    pub const fn bulk_cancel_nonce(&self) -> Option<U256> {
        match self.protocol {
            ProtocolKind::PaymentProcessorV2 => self.master_nonce,
            _ => self.nonce,
        }
    }

    /// Returns true if the order counts towards floor ask or top bid.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.fillability_status == FillabilityStatus::Fillable
            && self.approval_status == ApprovalStatus::Approved
    }
}

/// Best prices of a collection or of a single token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// NFT contract.
    pub contract: Address,
    /// Token, or `None` for the whole collection.
    pub token_id: Option<U256>,
    /// Cheapest active listing.
    pub floor_ask: Option<U256>,
    /// Highest active bid.
    pub top_bid: Option<U256>,
}

impl CollectionStats {
    /// Derives stats from a set of orders.
    #[must_use]
    pub fn from_orders<'a>(
        contract: Address,
        token_id: Option<U256>,
        orders: impl IntoIterator<Item = &'a OrderRecord>,
    ) -> Self {
        let mut stats = Self {
            contract,
            token_id,
            floor_ask: None,
            top_bid: None,
        };
        for order in orders {
            if order.contract != contract
                || token_id.is_some_and(|id| id != order.token_id)
                || !order.is_active()
            {
                continue;
            }
            match order.side {
                OrderSide::Sell => {
                    stats.floor_ask = Some(stats.floor_ask.map_or(order.price, |p| p.min(order.price)));
                }
                OrderSide::Buy => {
                    stats.top_bid = Some(stats.top_bid.map_or(order.price, |p| p.max(order.price)));
                }
            }
        }
        stats
    }
}

/// Status an order should have given the nonce records, if it must change.
pub(crate) fn nonce_status(
    order: &OrderRecord,
    master_nonce: U256,
    invalidated: Option<bool>,
) -> Option<FillabilityStatus> {
    if order.fillability_status.is_terminal() {
        return None;
    }
    if order
        .bulk_cancel_nonce()
        .is_some_and(|signed| signed < master_nonce)
    {
        return Some(FillabilityStatus::Cancelled);
    }
    invalidated.map(|was_cancellation| {
        if was_cancellation {
            FillabilityStatus::Cancelled
        } else {
            FillabilityStatus::Filled
        }
    })
}

/// Persistence boundary of the commit stage and the follow-on jobs.
#[async_trait]
pub trait OrderBookStore: Send + Sync {
    /// Inserts fills keyed on `(tx, log index, batch index)`.
    ///
    /// Returns the number of rows that were new.
    async fn insert_fills(&self, fills: &[FillEvent]) -> Result<usize, StoreError>;

    /// Inserts cancellation events keyed on their log position.
    async fn insert_cancels(&self, cancels: &[CancelEvent]) -> Result<usize, StoreError>;

    /// Applies a status update under the recheck condition.
    ///
    /// Returns false if the order is unknown or the update is not newer.
    async fn apply_order_update(&self, update: &OrderUpdate) -> Result<bool, StoreError>;

    /// Raises the maker's counter and cancels orders signed below it.
    ///
    /// Returns the ids of the orders that changed.
    async fn apply_bulk_cancel(&self, event: &BulkCancelEvent) -> Result<Vec<B256>, StoreError>;

    /// Records a consumed or cancelled nonce and updates the matching orders.
    ///
    /// Returns the ids of the orders that changed.
    async fn apply_nonce_invalidation(
        &self,
        event: &NonceInvalidation,
    ) -> Result<Vec<B256>, StoreError>;

    /// Inserts fungible transfers keyed on their log position.
    async fn insert_fungible_transfers(
        &self,
        transfers: &[FungibleTransfer],
    ) -> Result<usize, StoreError>;

    /// Inserts swaps, at most one per transaction.
    async fn insert_swaps(&self, swaps: &[Swap]) -> Result<usize, StoreError>;

    /// Returns the maker's current counter, zero if never raised.
    async fn master_nonce(&self, protocol: ProtocolKind, maker: Address)
        -> Result<U256, StoreError>;

    /// Looks up an order by maker and nonce.
    async fn find_order_id(
        &self,
        protocol: ProtocolKind,
        maker: Address,
        nonce: U256,
    ) -> Result<Option<B256>, StoreError>;

    /// Returns an order.
    async fn get_order(&self, id: B256) -> Result<Option<OrderRecord>, StoreError>;

    /// Returns a maker's orders, optionally restricted to one contract.
    async fn orders_by_maker(
        &self,
        maker: Address,
        contract: Option<Address>,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Inserts an order, or overwrites it under the recheck condition.
    ///
    /// Returns true if the row changed.
    async fn upsert_order(&self, order: &OrderRecord) -> Result<bool, StoreError>;

    /// Re-derives an order's fillability from the nonce records.
    ///
    /// Returns the status after revalidation, or `None` for unknown orders.
    async fn revalidate_order(&self, id: B256) -> Result<Option<FillabilityStatus>, StoreError>;

    /// Recomputes and stores floor ask and top bid.
    async fn recompute_collection(
        &self,
        contract: Address,
        token_id: Option<U256>,
    ) -> Result<CollectionStats, StoreError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn order(id: u8, side: OrderSide, price: u64) -> OrderRecord {
        OrderRecord {
            id: B256::repeat_byte(id),
            protocol: ProtocolKind::PaymentProcessorV2,
            side,
            maker: Address::repeat_byte(0x11),
            contract: Address::repeat_byte(0xcc),
            token_id: U256::from(5),
            nonce: Some(U256::from(id)),
            master_nonce: Some(U256::ZERO),
            price: U256::from(price),
            currency: Address::ZERO,
            fillability_status: FillabilityStatus::Fillable,
            approval_status: ApprovalStatus::Approved,
            block_number: 1,
            log_index: 0,
        }
    }

    #[test]
    fn test_status_names() {
        for status in [
            FillabilityStatus::Fillable,
            FillabilityStatus::Filled,
            FillabilityStatus::Cancelled,
            FillabilityStatus::NoBalance,
        ] {
            assert_eq!(FillabilityStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            ApprovalStatus::parse(ApprovalStatus::NoApproval.as_str()),
            Some(ApprovalStatus::NoApproval)
        );
    }

    #[test]
    fn test_collection_stats_from_orders() {
        let mut revoked = order(4, OrderSide::Sell, 1);
        revoked.approval_status = ApprovalStatus::NoApproval;
        let orders = vec![
            order(1, OrderSide::Sell, 300),
            order(2, OrderSide::Sell, 200),
            order(3, OrderSide::Buy, 150),
            revoked,
        ];
        let stats = CollectionStats::from_orders(Address::repeat_byte(0xcc), None, &orders);

        assert_eq!(stats.floor_ask, Some(U256::from(200)));
        assert_eq!(stats.top_bid, Some(U256::from(150)));

        let other = CollectionStats::from_orders(Address::repeat_byte(0xdd), None, &orders);
        assert_eq!(other.floor_ask, None);
    }

    #[test]
    fn test_nonce_status() {
        let mut live = order(3, OrderSide::Sell, 1);
        live.master_nonce = Some(U256::from(2));
        assert_eq!(
            nonce_status(&live, U256::from(3), None),
            Some(FillabilityStatus::Cancelled)
        );
        assert_eq!(nonce_status(&live, U256::from(2), None), None);
        assert_eq!(
            nonce_status(&live, U256::ZERO, Some(false)),
            Some(FillabilityStatus::Filled)
        );

        let mut done = live;
        done.fillability_status = FillabilityStatus::Filled;
        assert_eq!(nonce_status(&done, U256::from(9), Some(true)), None);
    }

    #[test]
    fn test_bulk_cancel_nonce_by_protocol() {
        let mut pp = order(1, OrderSide::Sell, 1);
        pp.nonce = Some(U256::from(1000));
        assert_eq!(pp.bulk_cancel_nonce(), Some(U256::ZERO));
        // A high order nonce does not shield an order from a master nonce bump.
        assert_eq!(
            nonce_status(&pp, U256::from(1), None),
            Some(FillabilityStatus::Cancelled)
        );

        let mut seaport = pp;
        seaport.protocol = ProtocolKind::Seaport;
        seaport.master_nonce = None;
        assert_eq!(seaport.bulk_cancel_nonce(), Some(U256::from(1000)));
        assert_eq!(nonce_status(&seaport, U256::from(1), None), None);
    }
}
