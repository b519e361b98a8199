//! Event aggregation for the Orderflow indexer.
//!
//! Raw chain logs are classified by signature, decoded by the protocol
//! handlers into mutation records and accumulated per batch.
//!
//! # Components
//!
//! - [`log`]: Raw and classified logs
//! - [`classifier`]: `(topic0, topic count)` signature registry
//! - [`types`]: Mutation records
//! - [`accumulator`]: Batch-scoped `OnChainData`
//! - [`processor`]: Fan-out to the protocol handlers
//! - [`cursor`]: Chain head tracking for the sync poller
//! - [`metrics`]: Event processing metrics

pub mod accumulator;
pub mod classifier;
pub mod cursor;
pub mod log;
pub mod metrics;
pub mod processor;
pub mod types;

pub use accumulator::OnChainData;
pub use classifier::LogClassifier;
pub use cursor::{BlockRange, SyncCursor};
pub use log::{ClassifiedEvent, EventContext, EventKind, ProtocolKind, RawLog};
pub use metrics::{EventMetrics, EventMetricsSnapshot};
pub use processor::{BatchOutcome, EventProcessor};
pub use types::{
    BulkCancelEvent, CancelEvent, FillEvent, FungibleTransfer, MakerStateTrigger,
    NonceInvalidation, OrderSide, OrderTrigger, OrderUpdate, Swap, TriggerKind,
};
