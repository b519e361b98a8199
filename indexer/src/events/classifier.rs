//! Log classifier.
//!
//! Maps `(topic0, topic count)` to an event kind. ERC-20 and ERC-721
//! `Transfer` share a signature and differ only in how many topics they carry.
//! Exchange events can be pinned to the exchange addresses so look-alike
//! contracts are ignored.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;

use super::log::{ClassifiedEvent, EventKind, RawLog};
use crate::abi::{IPaymentProcessor, ISeaport, IERC20, IERC721, IWETH};
use crate::config::ProtocolAddresses;

#[derive(Debug, Clone)]
struct Entry {
    kind: EventKind,
    addresses: Option<HashSet<Address>>,
}

impl Entry {
    fn accepts(&self, address: &Address) -> bool {
        self.addresses
            .as_ref()
            .is_none_or(|allowed| allowed.contains(address))
    }
}

/// Registry of known event signatures.
#[derive(Debug, Clone, Default)]
pub struct LogClassifier {
    entries: HashMap<(B256, usize), Vec<Entry>>,
}

impl LogClassifier {
    /// Creates an empty classifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a classifier with every supported event registered.
    #[must_use]
    pub fn with_protocols(addresses: &ProtocolAddresses) -> Self {
        let mut classifier = Self::new();
        let seaport = Some(addresses.seaport.iter().copied().collect::<Vec<_>>());
        let payment_processor = Some(vec![addresses.payment_processor]);
        let weth = Some(vec![addresses.weth]);

        classifier.register(
            ISeaport::OrderFulfilled::SIGNATURE_HASH,
            3,
            EventKind::SeaportOrderFulfilled,
            seaport.clone(),
        );
        classifier.register(
            ISeaport::OrderCancelled::SIGNATURE_HASH,
            3,
            EventKind::SeaportOrderCancelled,
            seaport.clone(),
        );
        classifier.register(
            ISeaport::CounterIncremented::SIGNATURE_HASH,
            2,
            EventKind::SeaportCounterIncremented,
            seaport,
        );

        classifier.register(
            IPaymentProcessor::BuyListingERC721::SIGNATURE_HASH,
            4,
            EventKind::PaymentProcessorBuyListingErc721,
            payment_processor.clone(),
        );
        classifier.register(
            IPaymentProcessor::BuyListingERC1155::SIGNATURE_HASH,
            4,
            EventKind::PaymentProcessorBuyListingErc1155,
            payment_processor.clone(),
        );
        classifier.register(
            IPaymentProcessor::AcceptOfferERC721::SIGNATURE_HASH,
            4,
            EventKind::PaymentProcessorAcceptOfferErc721,
            payment_processor.clone(),
        );
        classifier.register(
            IPaymentProcessor::AcceptOfferERC1155::SIGNATURE_HASH,
            4,
            EventKind::PaymentProcessorAcceptOfferErc1155,
            payment_processor.clone(),
        );
        classifier.register(
            IPaymentProcessor::NonceInvalidated::SIGNATURE_HASH,
            3,
            EventKind::PaymentProcessorNonceInvalidated,
            payment_processor.clone(),
        );
        classifier.register(
            IPaymentProcessor::MasterNonceInvalidated::SIGNATURE_HASH,
            2,
            EventKind::PaymentProcessorMasterNonceInvalidated,
            payment_processor,
        );

        classifier.register(IERC20::Transfer::SIGNATURE_HASH, 3, EventKind::Erc20Transfer, None);
        classifier.register(IERC20::Approval::SIGNATURE_HASH, 3, EventKind::Erc20Approval, None);
        classifier.register(IWETH::Deposit::SIGNATURE_HASH, 2, EventKind::WethDeposit, weth.clone());
        classifier.register(IWETH::Withdrawal::SIGNATURE_HASH, 2, EventKind::WethWithdrawal, weth);

        classifier.register(IERC721::Transfer::SIGNATURE_HASH, 4, EventKind::Erc721Transfer, None);
        classifier.register(
            IERC721::ApprovalForAll::SIGNATURE_HASH,
            3,
            EventKind::Erc721ApprovalForAll,
            None,
        );

        classifier
    }

    /// Registers an event. `addresses` pins it to specific emitters.
    pub fn register(
        &mut self,
        topic0: B256,
        topic_count: usize,
        kind: EventKind,
        addresses: Option<Vec<Address>>,
    ) {
        self.entries
            .entry((topic0, topic_count))
            .or_default()
            .push(Entry {
                kind,
                addresses: addresses.map(|a| a.into_iter().collect()),
            });
    }

    /// Resolves the event kind of a log.
    #[must_use]
    pub fn kind_of(&self, log: &RawLog) -> Option<EventKind> {
        let topic0 = log.topic0()?;
        self.entries
            .get(&(topic0, log.topics.len()))?
            .iter()
            .find(|entry| entry.accepts(&log.address))
            .map(|entry| entry.kind)
    }

    /// Classifies a log. Unknown logs yield `None`.
    #[must_use]
    pub fn classify(&self, log: RawLog) -> Option<ClassifiedEvent> {
        let kind = self.kind_of(&log)?;
        Some(ClassifiedEvent { log, kind })
    }

    /// Returns the distinct signature topics, for `eth_getLogs` filters.
    #[must_use]
    pub fn signatures(&self) -> Vec<B256> {
        let mut topics: Vec<B256> = self.entries.keys().map(|(topic0, _)| *topic0).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Number of registered signatures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
