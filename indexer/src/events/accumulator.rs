//! Batch-scoped accumulator of mutation records.

use std::collections::HashSet;

use super::types::{
    BulkCancelEvent, CancelEvent, FillEvent, FungibleTransfer, MakerStateTrigger,
    NonceInvalidation, OrderTrigger, Swap, TriggerKey,
};

/// Everything one batch of logs decodes into.
///
/// Each protocol handler writes into its own instance; the processor merges
/// them afterwards. Maker-state triggers are deduplicated per
/// `(tx, contract, maker, kind)` on insert and on merge.
#[derive(Debug, Clone, Default)]
pub struct OnChainData {
    /// Fills.
    pub fill_events: Vec<FillEvent>,
    /// Single-order cancellations.
    pub cancel_events: Vec<CancelEvent>,
    /// Counter bumps.
    pub bulk_cancel_events: Vec<BulkCancelEvent>,
    /// Nonce invalidations.
    pub nonce_invalidations: Vec<NonceInvalidation>,
    /// Fungible value movements.
    pub fungible_transfers: Vec<FungibleTransfer>,
    /// Detected swaps.
    pub swaps: Vec<Swap>,
    /// Single-order revalidation requests.
    pub order_triggers: Vec<OrderTrigger>,
    maker_state_triggers: Vec<MakerStateTrigger>,
    trigger_keys: HashSet<TriggerKey>,
}

impl OnChainData {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a maker-state trigger unless an equivalent one exists.
    ///
    /// Returns true if the trigger was added.
    pub fn add_maker_trigger(&mut self, trigger: MakerStateTrigger) -> bool {
        if !self.trigger_keys.insert(trigger.dedup_key()) {
            return false;
        }
        self.maker_state_triggers.push(trigger);
        true
    }

    /// Returns the deduplicated maker-state triggers.
    #[must_use]
    pub fn maker_state_triggers(&self) -> &[MakerStateTrigger] {
        &self.maker_state_triggers
    }

    /// Appends everything from `other`.
    pub fn merge(&mut self, other: Self) {
        self.fill_events.extend(other.fill_events);
        self.cancel_events.extend(other.cancel_events);
        self.bulk_cancel_events.extend(other.bulk_cancel_events);
        self.nonce_invalidations.extend(other.nonce_invalidations);
        self.fungible_transfers.extend(other.fungible_transfers);
        self.swaps.extend(other.swaps);
        self.order_triggers.extend(other.order_triggers);
        for trigger in other.maker_state_triggers {
            self.add_maker_trigger(trigger);
        }
    }

    /// Total number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fill_events.len()
            + self.cancel_events.len()
            + self.bulk_cancel_events.len()
            + self.nonce_invalidations.len()
            + self.fungible_transfers.len()
            + self.swaps.len()
            + self.order_triggers.len()
            + self.maker_state_triggers.len()
    }

    /// Returns true if nothing was accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
