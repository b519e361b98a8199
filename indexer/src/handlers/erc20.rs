//! ERC-20 and wrapped native handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{approval_trigger, balance_trigger, decode, ProtocolHandler};
use crate::abi::{IERC20, IWETH};
use crate::error::{DecodeError, IndexerError};
use crate::events::accumulator::OnChainData;
use crate::events::log::{ClassifiedEvent, EventKind, ProtocolKind, RawLog};
use crate::events::types::FungibleTransfer;
use crate::swap::{detect_swap, TransactionProvider};

/// Decodes fungible transfers and approvals, then detects swaps.
pub struct Erc20Handler {
    transactions: Arc<dyn TransactionProvider>,
    relay_solvers: HashSet<Address>,
}

impl Erc20Handler {
    /// Creates the handler.
    #[must_use]
    pub fn new(transactions: Arc<dyn TransactionProvider>, relay_solvers: HashSet<Address>) -> Self {
        Self {
            transactions,
            relay_solvers,
        }
    }

    fn push_transfer(data: &mut OnChainData, transfer: FungibleTransfer) {
        if !transfer.is_native() {
            for side in [transfer.from, transfer.to] {
                if side != Address::ZERO {
                    data.add_maker_trigger(balance_trigger(transfer.ctx, side, transfer.currency));
                }
            }
        }
        data.fungible_transfers.push(transfer);
    }

    fn on_log(event: &ClassifiedEvent, data: &mut OnChainData) -> Result<(), DecodeError> {
        let log: &RawLog = &event.log;
        let ctx = log.context();
        match event.kind {
            EventKind::Erc20Transfer => {
                let e: IERC20::Transfer = decode(log)?;
                Self::push_transfer(
                    data,
                    FungibleTransfer {
                        ctx,
                        from: e.from,
                        to: e.to,
                        currency: log.address,
                        amount: e.value,
                    },
                );
            }
            EventKind::WethDeposit => {
                let e: IWETH::Deposit = decode(log)?;
                Self::push_transfer(
                    data,
                    FungibleTransfer {
                        ctx,
                        from: Address::ZERO,
                        to: e.dst,
                        currency: log.address,
                        amount: e.wad,
                    },
                );
            }
            EventKind::WethWithdrawal => {
                let e: IWETH::Withdrawal = decode(log)?;
                Self::push_transfer(
                    data,
                    FungibleTransfer {
                        ctx,
                        from: e.src,
                        to: Address::ZERO,
                        currency: log.address,
                        amount: e.wad,
                    },
                );
                Self::push_transfer(
                    data,
                    FungibleTransfer {
                        ctx: ctx.with_batch_index(ctx.batch_index.saturating_add(1)),
                        from: log.address,
                        to: e.src,
                        currency: Address::ZERO,
                        amount: e.wad,
                    },
                );
            }
            EventKind::Erc20Approval => {
                let e: IERC20::Approval = decode(log)?;
                data.add_maker_trigger(approval_trigger(ctx, e.owner, log.address, e.spender));
            }
            _ => {}
        }
        Ok(())
    }

    /// Runs swap detection over the accumulated transfers, one transaction at
    /// a time.
    async fn detect_swaps(&self, data: &mut OnChainData) -> Result<(), IndexerError> {
        let mut tx_order: Vec<B256> = Vec::new();
        let mut by_tx: HashMap<B256, Vec<FungibleTransfer>> = HashMap::new();
        for transfer in &data.fungible_transfers {
            let legs = by_tx.entry(transfer.ctx.tx_hash).or_default();
            if legs.is_empty() {
                tx_order.push(transfer.ctx.tx_hash);
            }
            legs.push(transfer.clone());
        }

        for tx_hash in tx_order {
            let Some(legs) = by_tx.get(&tx_hash) else {
                continue;
            };
            if !self.could_be_swap(legs) {
                continue;
            }
            let tx = self.transactions.transaction(tx_hash).await?;
            if let Some(swap) = detect_swap(&tx, legs, &self.relay_solvers) {
                debug!(
                    tx = %tx_hash,
                    wallet = %swap.wallet,
                    from = %swap.from_currency,
                    to = %swap.to_currency,
                    "detected swap"
                );
                data.swaps.push(swap);
            }
        }
        Ok(())
    }

    /// Cheap pre-check so only plausible transactions are fetched.
    fn could_be_swap(&self, legs: &[FungibleTransfer]) -> bool {
        let (Some(first), Some(last)) = (legs.first(), legs.last()) else {
            return false;
        };
        if last.to == Address::ZERO {
            return false;
        }
        let round_trip = legs.len() >= 2 && first.from == last.to && first.currency != last.currency;
        round_trip || !self.relay_solvers.is_empty()
    }
}

#[async_trait]
impl ProtocolHandler for Erc20Handler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Erc20
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
                    "skipping undecodable erc20 log"
                );
            }
        }
        self.detect_swaps(data).await
    }
}
