//! Protocol event handlers.
//!
//! Each handler receives one protocol's classified logs, already sorted by
//! `(block, log index, batch index)`, and writes mutation records into the
//! accumulator it is given. A log that fails to decode is logged and skipped;
//! provider failures abort the handler so the batch can be retried.
//!
//! # Components
//!
//! - [`seaport`]: Seaport fills, cancels and counter bumps
//! - [`payment_processor`]: Payment Processor v2 fills and nonce events
//! - [`erc20`]: Fungible transfers, approvals and swaps
//! - [`erc721`]: NFT transfers and operator approvals

pub mod erc20;
pub mod erc721;
pub mod payment_processor;
pub mod seaport;

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;

use crate::error::{DecodeError, IndexerError};
use crate::events::accumulator::OnChainData;
use crate::events::log::{ClassifiedEvent, EventContext, ProtocolKind, RawLog};
use crate::events::types::{MakerStateTrigger, OrderTrigger, TriggerKind};

pub use erc20::Erc20Handler;
pub use erc721::Erc721Handler;
pub use payment_processor::PaymentProcessorHandler;
pub use seaport::SeaportHandler;

/// Decoder for one protocol's logs.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The protocol this handler owns.
    fn protocol(&self) -> ProtocolKind;

    /// Decodes `events` into `data`.
    async fn handle(
        &self,
        events: &[ClassifiedEvent],
        data: &mut OnChainData,
    ) -> Result<(), IndexerError>;
}

/// Dispatch table from protocol to handler, built once at startup.
#[derive(Clone, Default)]
pub struct ProtocolDispatch {
    handlers: HashMap<ProtocolKind, Arc<dyn ProtocolHandler>>,
}

impl ProtocolDispatch {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for its protocol.
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.handlers.insert(handler.protocol(), handler);
        self
    }

    /// Returns the handler for a protocol.
    #[must_use]
    pub fn get(&self, protocol: ProtocolKind) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(&protocol).map(Arc::clone)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) fn decode<E: SolEvent>(log: &RawLog) -> Result<E, DecodeError> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data)
        .map_err(|e| DecodeError::abi(E::SIGNATURE, e))
}

pub(crate) fn balance_trigger(
    ctx: EventContext,
    maker: Address,
    contract: Address,
) -> MakerStateTrigger {
    MakerStateTrigger {
        ctx,
        maker,
        contract,
        kind: TriggerKind::Balance,
        operator: None,
    }
}

pub(crate) fn approval_trigger(
    ctx: EventContext,
    maker: Address,
    contract: Address,
    operator: Address,
) -> MakerStateTrigger {
    MakerStateTrigger {
        ctx,
        maker,
        contract,
        kind: TriggerKind::Approval,
        operator: Some(operator),
    }
}

pub(crate) fn order_trigger(ctx: EventContext, order_id: B256) -> OrderTrigger {
    OrderTrigger {
        ctx,
        order_id,
        context: format!("{}-{}-{}", ctx.tx_hash, ctx.log_index, ctx.batch_index),
    }
}
