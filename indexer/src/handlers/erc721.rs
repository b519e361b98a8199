//! ERC-721 handler.

use alloy_primitives::Address;
use async_trait::async_trait;
use tracing::warn;

use super::{approval_trigger, balance_trigger, decode, ProtocolHandler};
use crate::abi::IERC721;
use crate::error::{DecodeError, IndexerError};
use crate::events::accumulator::OnChainData;
use crate::events::log::{ClassifiedEvent, EventKind, ProtocolKind};

/// Turns NFT transfers and operator approvals into maker-state triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Erc721Handler;

impl Erc721Handler {
    /// Creates the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn on_log(event: &ClassifiedEvent, data: &mut OnChainData) -> Result<(), DecodeError> {
        let log = &event.log;
        match event.kind {
            EventKind::Erc721Transfer => {
                let e: IERC721::Transfer = decode(log)?;
                // Only the sender can lose a listed token.
                if e.from != Address::ZERO {
                    data.add_maker_trigger(balance_trigger(log.context(), e.from, log.address));
                }
            }
            EventKind::Erc721ApprovalForAll => {
                let e: IERC721::ApprovalForAll = decode(log)?;
                data.add_maker_trigger(approval_trigger(
                    log.context(),
                    e.owner,
                    log.address,
                    e.operator,
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for Erc721Handler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Erc721
    }

    async fn handle(
        &self,
        events: &[ClassifiedEvent],
        data: &mut OnChainData,
    ) -> Result<(), IndexerError> {
        for event in events {
            if let Err(e) = Self::on_log(event, data) {
                warn!(
                    tx = %event.log.tx_hash,
                    log_index = event.log.log_index,
                    error = %e,
                    "skipping undecodable erc721 log"
                );
            }
        }
        Ok(())
    }
}
