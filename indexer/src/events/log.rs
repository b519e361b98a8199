//! Raw and classified chain logs.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Protocol families with a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Seaport.
    Seaport,
    /// Payment Processor v2.
    PaymentProcessorV2,
    /// ERC-20 tokens and wrapped native.
    Erc20,
    /// ERC-721 tokens.
    Erc721,
}

impl ProtocolKind {
    /// Returns a stable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Seaport => "seaport",
            Self::PaymentProcessorV2 => "payment-processor-v2",
            Self::Erc20 => "erc20",
            Self::Erc721 => "erc721",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "seaport" => Some(Self::Seaport),
            "payment-processor-v2" => Some(Self::PaymentProcessorV2),
            "erc20" => Some(Self::Erc20),
            "erc721" => Some(Self::Erc721),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds the classifier can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Seaport `OrderFulfilled`.
    SeaportOrderFulfilled,
    /// Seaport `OrderCancelled`.
    SeaportOrderCancelled,
    /// Seaport `CounterIncremented`.
    SeaportCounterIncremented,
    /// Payment Processor `BuyListingERC721`.
    PaymentProcessorBuyListingErc721,
    /// Payment Processor `BuyListingERC1155`.
    PaymentProcessorBuyListingErc1155,
    /// Payment Processor `AcceptOfferERC721`.
    PaymentProcessorAcceptOfferErc721,
    /// Payment Processor `AcceptOfferERC1155`.
    PaymentProcessorAcceptOfferErc1155,
    /// Payment Processor `NonceInvalidated`.
    PaymentProcessorNonceInvalidated,
    /// Payment Processor `MasterNonceInvalidated`.
    PaymentProcessorMasterNonceInvalidated,
    /// ERC-20 `Transfer`.
    Erc20Transfer,
    /// ERC-20 `Approval`.
    Erc20Approval,
    /// WETH `Deposit`.
    WethDeposit,
    /// WETH `Withdrawal`.
    WethWithdrawal,
    /// ERC-721 `Transfer`.
    Erc721Transfer,
    /// ERC-721 `ApprovalForAll`.
    Erc721ApprovalForAll,
}

impl EventKind {
    /// Returns the protocol that owns this event.
    #[must_use]
    pub const fn protocol(&self) -> ProtocolKind {
        match self {
            Self::SeaportOrderFulfilled
            | Self::SeaportOrderCancelled
            | Self::SeaportCounterIncremented => ProtocolKind::Seaport,
            Self::PaymentProcessorBuyListingErc721
            | Self::PaymentProcessorBuyListingErc1155
            | Self::PaymentProcessorAcceptOfferErc721
            | Self::PaymentProcessorAcceptOfferErc1155
            | Self::PaymentProcessorNonceInvalidated
            | Self::PaymentProcessorMasterNonceInvalidated => ProtocolKind::PaymentProcessorV2,
            Self::Erc20Transfer | Self::Erc20Approval | Self::WethDeposit | Self::WethWithdrawal => {
                ProtocolKind::Erc20
            }
            Self::Erc721Transfer | Self::Erc721ApprovalForAll => ProtocolKind::Erc721,
        }
    }
}

/// A log as observed on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics, signature first.
    pub topics: Vec<B256>,
    /// Non-indexed data.
    pub data: Bytes,
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: B256,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Position of the transaction in the block.
    pub tx_index: u64,
    /// Position of the log in the block.
    pub log_index: u64,
    /// Sub-position for logs that expand into several legs.
    #[serde(default = "default_batch_index")]
    pub batch_index: u64,
    /// Block timestamp in seconds.
    pub timestamp: u64,
}

const fn default_batch_index() -> u64 {
    1
}

impl RawLog {
    /// Returns the signature topic.
    #[must_use]
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }

    /// Ordering key within one protocol's logs.
    #[must_use]
    pub const fn ordering_key(&self) -> (u64, u64, u64) {
        (self.block_number, self.log_index, self.batch_index)
    }

    /// Returns the position fields every mutation record carries.
    #[must_use]
    pub const fn context(&self) -> EventContext {
        EventContext {
            address: self.address,
            block_number: self.block_number,
            block_hash: self.block_hash,
            tx_hash: self.tx_hash,
            tx_index: self.tx_index,
            log_index: self.log_index,
            batch_index: self.batch_index,
            timestamp: self.timestamp,
        }
    }
}

/// Position of a mutation record on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Emitting contract.
    pub address: Address,
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: B256,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Position of the transaction in the block.
    pub tx_index: u64,
    /// Position of the log in the block.
    pub log_index: u64,
    /// Sub-position within the log.
    pub batch_index: u64,
    /// Block timestamp in seconds.
    pub timestamp: u64,
}

impl EventContext {
    /// The `(block_number, log_index)` pair used by the recheck condition.
    #[must_use]
    pub const fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    /// Returns a copy with a different batch index.
    #[must_use]
    pub const fn with_batch_index(mut self, batch_index: u64) -> Self {
        self.batch_index = batch_index;
        self
    }
}

/// A log with its resolved protocol and event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    /// The raw log.
    pub log: RawLog,
    /// Resolved event kind.
    pub kind: EventKind,
}

impl ClassifiedEvent {
    /// Returns the owning protocol.
    #[must_use]
    pub const fn protocol(&self) -> ProtocolKind {
        self.kind.protocol()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(block: u64, index: u64, batch: u64) -> RawLog {
        RawLog {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number: block,
            block_hash: B256::ZERO,
            tx_hash: B256::ZERO,
            tx_index: 0,
            log_index: index,
            batch_index: batch,
            timestamp: 0,
        }
    }

    #[test]
    fn test_ordering_key() {
        let mut logs = vec![log(11, 0, 1), log(10, 5, 2), log(10, 5, 1), log(10, 3, 1)];
        logs.sort_by_key(RawLog::ordering_key);
        let keys: Vec<_> = logs.iter().map(RawLog::ordering_key).collect();
        assert_eq!(keys, vec![(10, 3, 1), (10, 5, 1), (10, 5, 2), (11, 0, 1)]);
    }

    #[test]
    fn test_event_kind_protocol() {
        assert_eq!(EventKind::WethWithdrawal.protocol(), ProtocolKind::Erc20);
        assert_eq!(
            EventKind::PaymentProcessorNonceInvalidated.protocol(),
            ProtocolKind::PaymentProcessorV2
        );
        assert_eq!(EventKind::Erc721Transfer.protocol(), ProtocolKind::Erc721);
        assert_eq!(ProtocolKind::PaymentProcessorV2.to_string(), "payment-processor-v2");
    }

    #[test]
    fn test_raw_log_deserialize_defaults_batch_index() {
        let json = serde_json::json!({
            "address": "0x0000000000000000000000000000000000000001",
            "topics": [],
            "data": "0x",
            "blockNumber": 7,
            "blockHash": B256::ZERO,
            "txHash": B256::ZERO,
            "txIndex": 0,
            "logIndex": 2,
            "timestamp": 1_700_000_000_u64
        });
        let log: RawLog = serde_json::from_value(json).expect("log");
        assert_eq!(log.batch_index, 1);
        assert_eq!(log.context().position(), (7, 2));
    }
}
