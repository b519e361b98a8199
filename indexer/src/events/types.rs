//! Mutation records produced by the protocol handlers.
//!
//! Every record carries the [`EventContext`] of the log it came from, so the
//! commit stage can key writes on `(tx, log index, batch index)` and guard
//! order updates with the `(block, log index)` recheck condition.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use super::log::{EventContext, ProtocolKind};

/// Which side of the book an order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Listing: the maker sells an NFT.
    Sell,
    /// Bid or offer: the maker buys an NFT.
    Buy,
}

impl OrderSide {
    /// Returns a human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
        }
    }

    /// Parses the stored name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sell" => Some(Self::Sell),
            "buy" => Some(Self::Buy),
            _ => None,
        }
    }
}

/// What a maker-state trigger asks to recheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// The maker's balance of `contract` changed.
    Balance,
    /// The maker's approval on `contract` changed.
    Approval,
}

impl TriggerKind {
    /// Returns a human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Approval => "approval",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillEvent {
    /// Log position.
    pub ctx: EventContext,
    /// Exchange protocol.
    pub protocol: ProtocolKind,
    /// Order hash, when known.
    pub order_id: Option<B256>,
    /// Side of the filled order.
    pub side: OrderSide,
    /// Order maker.
    pub maker: Address,
    /// Order taker.
    pub taker: Address,
    /// NFT contract.
    pub contract: Address,
    /// NFT token id.
    pub token_id: U256,
    /// Units filled.
    pub amount: U256,
    /// Total price paid.
    pub price: U256,
    /// Payment currency, zero for native.
    pub currency: Address,
}

impl FillEvent {
    /// Returns true if a listing was filled.
    #[must_use]
    pub fn is_listing(&self) -> bool {
        self.side == OrderSide::Sell
    }

    /// Returns the status update for the filled order, if its id is known.
    #[must_use]
    pub fn order_update(&self) -> Option<OrderUpdate> {
        self.order_id.map(|order_id| OrderUpdate::Filled {
            order_id,
            block_number: self.ctx.block_number,
            log_index: self.ctx.log_index,
        })
    }
}

/// A single order cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelEvent {
    /// Log position.
    pub ctx: EventContext,
    /// Exchange protocol.
    pub protocol: ProtocolKind,
    /// Cancelled order hash.
    pub order_id: B256,
    /// Order maker.
    pub maker: Address,
}

/// All of a maker's orders below a nonce were invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCancelEvent {
    /// Log position.
    pub ctx: EventContext,
    /// Exchange protocol.
    pub protocol: ProtocolKind,
    /// Maker whose counter moved.
    pub maker: Address,
    /// New counter; orders signed below it are dead.
    pub min_nonce: U256,
}

/// A single nonce was consumed or cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceInvalidation {
    /// Log position.
    pub ctx: EventContext,
    /// Exchange protocol.
    pub protocol: ProtocolKind,
    /// Nonce owner.
    pub maker: Address,
    /// Invalidated nonce.
    pub nonce: U256,
    /// False when the nonce was consumed by a fill.
    pub was_cancellation: bool,
}

/// Request to revalidate a maker's orders on one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakerStateTrigger {
    /// Log position.
    pub ctx: EventContext,
    /// Maker to revalidate.
    pub maker: Address,
    /// Token contract whose state changed.
    pub contract: Address,
    /// Balance or approval.
    pub kind: TriggerKind,
    /// Approved operator, for approval triggers.
    pub operator: Option<Address>,
}

/// Dedup key of a maker-state trigger within one batch.
pub type TriggerKey = (B256, Address, Address, TriggerKind);

impl MakerStateTrigger {
    /// Returns the `(tx, contract, maker, kind)` dedup key.
    #[must_use]
    pub const fn dedup_key(&self) -> TriggerKey {
        (self.ctx.tx_hash, self.contract, self.maker, self.kind)
    }

    /// Returns the follow-on job dedup context.
    #[must_use]
    pub fn context_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.kind, self.ctx.tx_hash, self.maker, self.contract
        )
    }
}

/// A movement of fungible value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FungibleTransfer {
    /// Log position.
    pub ctx: EventContext,
    /// Sender, zero for mints.
    pub from: Address,
    /// Recipient, zero for burns.
    pub to: Address,
    /// Token, zero for native.
    pub currency: Address,
    /// Amount moved.
    pub amount: U256,
}

impl FungibleTransfer {
    /// Returns true for native currency legs.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.currency == Address::ZERO
    }
}

/// A wallet exchanged one currency for another within one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    /// Position of the first leg.
    pub ctx: EventContext,
    /// Transaction sender.
    pub wallet: Address,
    /// Currency given up.
    pub from_currency: Address,
    /// Amount given up.
    pub from_amount: U256,
    /// Currency received.
    pub to_currency: Address,
    /// Amount received.
    pub to_amount: U256,
}

/// Request to revalidate a single order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTrigger {
    /// Log position.
    pub ctx: EventContext,
    /// Order to revalidate.
    pub order_id: B256,
    /// Dedup context for the follow-on job.
    pub context: String,
}

/// A status change applied to a stored order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdate {
    /// Order was filled.
    Filled {
        /// Order hash.
        order_id: B256,
        /// Block of the fill.
        block_number: u64,
        /// Log index of the fill.
        log_index: u64,
    },

    /// Order was cancelled.
    Cancelled {
        /// Order hash.
        order_id: B256,
        /// Block of the cancellation.
        block_number: u64,
        /// Log index of the cancellation.
        log_index: u64,
    },
}

impl OrderUpdate {
    /// Returns the order id.
    #[must_use]
    pub const fn order_id(&self) -> B256 {
        match self {
            Self::Filled { order_id, .. } | Self::Cancelled { order_id, .. } => *order_id,
        }
    }

    /// Returns the `(block, log index)` position of the update.
    #[must_use]
    pub const fn position(&self) -> (u64, u64) {
        match self {
            Self::Filled {
                block_number,
                log_index,
                ..
            }
            | Self::Cancelled {
                block_number,
                log_index,
                ..
            } => (*block_number, *log_index),
        }
    }

    /// Returns true if this is a fill update.
    #[must_use]
    pub const fn is_fill(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

impl From<&CancelEvent> for OrderUpdate {
    fn from(cancel: &CancelEvent) -> Self {
        Self::Cancelled {
            order_id: cancel.order_id,
            block_number: cancel.ctx.block_number,
            log_index: cancel.ctx.log_index,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ctx(block: u64, log_index: u64) -> EventContext {
        EventContext {
            address: Address::ZERO,
            block_number: block,
            block_hash: B256::ZERO,
            tx_hash: B256::with_last_byte(1),
            tx_index: 0,
            log_index,
            batch_index: 1,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_order_side_round_trip_names() {
        assert_eq!(OrderSide::parse(OrderSide::Sell.as_str()), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse(OrderSide::Buy.as_str()), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("ask"), None);
    }

    #[test]
    fn test_order_update_from_cancel() {
        let cancel = CancelEvent {
            ctx: ctx(10, 5),
            protocol: ProtocolKind::Seaport,
            order_id: B256::repeat_byte(0xab),
            maker: Address::repeat_byte(1),
        };
        let update = OrderUpdate::from(&cancel);

        assert!(!update.is_fill());
        assert_eq!(update.order_id(), B256::repeat_byte(0xab));
        assert_eq!(update.position(), (10, 5));
    }

    #[test]
    fn test_fill_without_order_id_has_no_update() {
        let fill = FillEvent {
            ctx: ctx(3, 1),
            protocol: ProtocolKind::PaymentProcessorV2,
            order_id: None,
            side: OrderSide::Sell,
            maker: Address::repeat_byte(1),
            taker: Address::repeat_byte(2),
            contract: Address::repeat_byte(3),
            token_id: U256::from(5),
            amount: U256::from(1),
            price: U256::from(100),
            currency: Address::ZERO,
        };
        assert!(fill.is_listing());
        assert_eq!(fill.order_update(), None);

        let with_id = FillEvent {
            order_id: Some(B256::repeat_byte(9)),
            ..fill
        };
        let update = with_id.order_update().expect("update");
        assert!(update.is_fill());
        assert_eq!(update.position(), (3, 1));
    }

    #[test]
    fn test_trigger_context_id() {
        let trigger = MakerStateTrigger {
            ctx: ctx(1, 0),
            maker: Address::repeat_byte(0x11),
            contract: Address::repeat_byte(0x22),
            kind: TriggerKind::Balance,
            operator: None,
        };
        let id = trigger.context_id();
        assert!(id.starts_with("balance-0x"));
        assert_eq!(
            trigger.dedup_key(),
            (
                B256::with_last_byte(1),
                Address::repeat_byte(0x22),
                Address::repeat_byte(0x11),
                TriggerKind::Balance
            )
        );
    }
}
