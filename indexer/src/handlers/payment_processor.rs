//! Payment Processor v2 handler.
//!
//! Sale events carry neither the order hash nor the per-item price the maker
//! signed, so fills are grouped per transaction and reconciled against the
//! transaction's call trace. The trace is fetched once per transaction.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{approval_trigger, decode, order_trigger, ProtocolHandler};
use crate::abi::IPaymentProcessor;
use crate::error::{DecodeError, IndexerError};
use crate::events::accumulator::OnChainData;
use crate::events::log::{ClassifiedEvent, EventContext, EventKind, ProtocolKind, RawLog};
use crate::events::metrics::EventMetrics;
use crate::events::types::{BulkCancelEvent, FillEvent, NonceInvalidation, OrderSide};
use crate::reconciler::{Reconciler, SaleKey};
use crate::trace::TraceProvider;

/// A sale event before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFill {
    ctx: EventContext,
    side: OrderSide,
    maker: Address,
    taker: Address,
    contract: Address,
    token_id: U256,
    amount: U256,
    price: U256,
    currency: Address,
}

impl PendingFill {
    const fn key(&self) -> SaleKey {
        SaleKey {
            token_address: self.contract,
            token_id: self.token_id,
            payment_method: self.currency,
        }
    }

    fn into_fill(self, order_id: Option<B256>) -> FillEvent {
        FillEvent {
            ctx: self.ctx,
            protocol: ProtocolKind::PaymentProcessorV2,
            order_id,
            side: self.side,
            maker: self.maker,
            taker: self.taker,
            contract: self.contract,
            token_id: self.token_id,
            amount: self.amount,
            price: self.price,
            currency: self.currency,
        }
    }
}

fn pending_fill(event: &ClassifiedEvent) -> Result<Option<PendingFill>, DecodeError> {
    let log = &event.log;
    let ctx = log.context();
    let fill = match event.kind {
        EventKind::PaymentProcessorBuyListingErc721 => {
            let e: IPaymentProcessor::BuyListingERC721 = decode(log)?;
            PendingFill {
                ctx,
                side: OrderSide::Sell,
                maker: e.seller,
                taker: e.buyer,
                contract: e.tokenAddress,
                token_id: e.tokenId,
                amount: U256::from(1),
                price: e.salePrice,
                currency: e.paymentCoin,
            }
        }
        EventKind::PaymentProcessorBuyListingErc1155 => {
            let e: IPaymentProcessor::BuyListingERC1155 = decode(log)?;
            PendingFill {
                ctx,
                side: OrderSide::Sell,
                maker: e.seller,
                taker: e.buyer,
                contract: e.tokenAddress,
                token_id: e.tokenId,
                amount: e.amount,
                price: e.salePrice,
                currency: e.paymentCoin,
            }
        }
        EventKind::PaymentProcessorAcceptOfferErc721 => {
            let e: IPaymentProcessor::AcceptOfferERC721 = decode(log)?;
            PendingFill {
                ctx,
                side: OrderSide::Buy,
                maker: e.buyer,
                taker: e.seller,
                contract: e.tokenAddress,
                token_id: e.tokenId,
                amount: U256::from(1),
                price: e.salePrice,
                currency: e.paymentCoin,
            }
        }
        EventKind::PaymentProcessorAcceptOfferErc1155 => {
            let e: IPaymentProcessor::AcceptOfferERC1155 = decode(log)?;
            PendingFill {
                ctx,
                side: OrderSide::Buy,
                maker: e.buyer,
                taker: e.seller,
                contract: e.tokenAddress,
                token_id: e.tokenId,
                amount: e.amount,
                price: e.salePrice,
                currency: e.paymentCoin,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(fill))
}

fn on_nonce_invalidated(log: &RawLog, data: &mut OnChainData) -> Result<(), DecodeError> {
    let event: IPaymentProcessor::NonceInvalidated = decode(log)?;
    data.nonce_invalidations.push(NonceInvalidation {
        ctx: log.context(),
        protocol: ProtocolKind::PaymentProcessorV2,
        maker: event.account,
        nonce: event.nonce,
        was_cancellation: event.wasCancellation,
    });
    Ok(())
}

fn on_master_nonce_invalidated(log: &RawLog, data: &mut OnChainData) -> Result<(), DecodeError> {
    let event: IPaymentProcessor::MasterNonceInvalidated = decode(log)?;
    // The event carries the revoked value; the new master nonce is one above.
    data.bulk_cancel_events.push(BulkCancelEvent {
        ctx: log.context(),
        protocol: ProtocolKind::PaymentProcessorV2,
        maker: event.account,
        min_nonce: event.nonce.saturating_add(U256::from(1)),
    });
    Ok(())
}

/// Decodes Payment Processor v2 events.
pub struct PaymentProcessorHandler {
    reconciler: Arc<Reconciler>,
    traces: Arc<dyn TraceProvider>,
    metrics: Arc<EventMetrics>,
}

impl PaymentProcessorHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(
        reconciler: Arc<Reconciler>,
        traces: Arc<dyn TraceProvider>,
        metrics: Arc<EventMetrics>,
    ) -> Self {
        Self {
            reconciler,
            traces,
            metrics,
        }
    }

    async fn reconcile_tx(
        &self,
        tx_hash: B256,
        pending: Vec<PendingFill>,
        data: &mut OnChainData,
    ) -> Result<(), IndexerError> {
        let trace = self.traces.trace_transaction(tx_hash).await?;
        let keys: Vec<SaleKey> = pending.iter().map(PendingFill::key).collect();
        let reconciliation = self.reconciler.reconcile(&trace, &keys).await?;

        for (fill, sale) in pending.into_iter().zip(reconciliation.sales) {
            let Some(sale) = sale else {
                self.metrics.record_reconciliation_miss();
                warn!(
                    tx = %tx_hash,
                    log_index = fill.ctx.log_index,
                    contract = %fill.contract,
                    token_id = %fill.token_id,
                    "no sale call matches fill, skipping"
                );
                continue;
            };

            if fill.currency != Address::ZERO
                && reconciliation.erc20_currencies.contains(&fill.currency)
            {
                data.add_maker_trigger(approval_trigger(
                    fill.ctx,
                    fill.maker,
                    fill.currency,
                    self.reconciler.exchange(),
                ));
            }

            match sale.order_id {
                Some(order_id) => data.order_triggers.push(order_trigger(fill.ctx, order_id)),
                None => debug!(tx = %tx_hash, maker = %fill.maker, "fill without recovered order id"),
            }
            data.fill_events.push(fill.into_fill(sale.order_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for PaymentProcessorHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::PaymentProcessorV2
    }

    async fn handle(
        &self,
        events: &[ClassifiedEvent],
        data: &mut OnChainData,
    ) -> Result<(), IndexerError> {
        let mut tx_order: Vec<B256> = Vec::new();
        let mut by_tx: HashMap<B256, Vec<PendingFill>> = HashMap::new();

        for event in events {
            let result = match event.kind {
                EventKind::PaymentProcessorNonceInvalidated => {
                    on_nonce_invalidated(&event.log, data)
                }
                EventKind::PaymentProcessorMasterNonceInvalidated => {
                    on_master_nonce_invalidated(&event.log, data)
                }
                _ => pending_fill(event).map(|pending| {
                    if let Some(fill) = pending {
                        let tx = fill.ctx.tx_hash;
                        let fills = by_tx.entry(tx).or_default();
                        if fills.is_empty() {
                            tx_order.push(tx);
                        }
                        fills.push(fill);
                    }
                }),
            };
            if let Err(e) = result {
                warn!(
                    tx = %event.log.tx_hash,
                    log_index = event.log.log_index,
                    error = %e,
                    "skipping undecodable payment processor log"
                );
            }
        }

        for tx_hash in tx_order {
            if let Some(pending) = by_tx.remove(&tx_hash) {
                self.reconcile_tx(tx_hash, pending, data).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{classified, StaticTraces};
    use crate::reconciler::tests::{bulk_buy, call_frame, order, COLLECTION, EXCHANGE, SELLER};
    use crate::store::{InMemoryOrderBookStore, OrderBookStore};
    use crate::trace::CallTrace;
    use alloy_sol_types::SolCall;

    const BUYER: Address = Address::repeat_byte(0xb1);
    const WETH: Address = Address::repeat_byte(0x77);

    fn buy_event(tx: u8, log_index: u64, token_id: u64, price: u64) -> ClassifiedEvent {
        classified(
            EventKind::PaymentProcessorBuyListingErc721,
            EXCHANGE,
            &IPaymentProcessor::BuyListingERC721 {
                buyer: BUYER,
                seller: SELLER,
                tokenAddress: COLLECTION,
                beneficiary: BUYER,
                paymentCoin: Address::ZERO,
                tokenId: U256::from(token_id),
                salePrice: U256::from(price),
            },
            tx,
            log_index,
        )
    }

    fn handler(traces: StaticTraces) -> (PaymentProcessorHandler, Arc<EventMetrics>) {
        let store: Arc<dyn OrderBookStore> = Arc::new(InMemoryOrderBookStore::new());
        let metrics = Arc::new(EventMetrics::new());
        let reconciler = Arc::new(Reconciler::new(EXCHANGE, 1, 4, store));
        (
            PaymentProcessorHandler::new(reconciler, Arc::new(traces), Arc::clone(&metrics)),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_bulk_buy_fills_reconciled_in_order() {
        let input = bulk_buy(vec![order(SELLER, 5, 100), order(SELLER, 9, 50)]);
        let mut traces = StaticTraces::default();
        traces.traces.insert(
            B256::with_last_byte(1),
            call_frame(EXCHANGE, input, vec![]),
        );
        let (handler, metrics) = handler(traces);

        let mut data = OnChainData::new();
        handler
            .handle(&[buy_event(1, 0, 5, 100), buy_event(1, 1, 9, 50)], &mut data)
            .await
            .expect("handle");

        assert_eq!(data.fill_events.len(), 2);
        assert_eq!(data.fill_events[0].token_id, U256::from(5));
        assert_eq!(data.fill_events[1].token_id, U256::from(9));
        assert_eq!(data.fill_events[0].side, OrderSide::Sell);
        assert_eq!(data.fill_events[0].maker, SELLER);
        assert_eq!(metrics.reconciliation_misses(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_fill_is_a_miss() {
        let input = bulk_buy(vec![order(SELLER, 5, 100)]);
        let mut traces = StaticTraces::default();
        traces.traces.insert(
            B256::with_last_byte(1),
            call_frame(EXCHANGE, input, vec![]),
        );
        let (handler, metrics) = handler(traces);

        let mut data = OnChainData::new();
        handler
            .handle(&[buy_event(1, 0, 5, 100), buy_event(1, 1, 6, 100)], &mut data)
            .await
            .expect("handle");

        assert_eq!(data.fill_events.len(), 1);
        assert_eq!(metrics.reconciliation_misses(), 1);
    }

    #[tokio::test]
    async fn test_missing_trace_fails_the_arm() {
        let (handler, _) = handler(StaticTraces::default());
        let mut data = OnChainData::new();
        let err = handler
            .handle(&[buy_event(3, 0, 5, 100)], &mut data)
            .await
            .expect_err("trace lookup fails");
        assert!(matches!(err, IndexerError::Trace(_)));
    }

    #[tokio::test]
    async fn test_erc20_payment_adds_approval_trigger() {
        let mut weth_order = order(BUYER, 5, 100);
        weth_order.paymentMethod = WETH;
        let input = crate::abi::IPaymentProcessor::acceptOfferCall {
            domainSeparator: B256::ZERO,
            isCollectionLevelOffer: false,
            saleDetails: weth_order,
            buyerSignature: crate::reconciler::tests::empty_signature(),
            tokenSetProof: IPaymentProcessor::TokenSetProof {
                rootHash: B256::ZERO,
                proof: vec![],
            },
            cosignature: IPaymentProcessor::Cosignature {
                signer: Address::ZERO,
                taker: Address::ZERO,
                expiration: U256::ZERO,
                v: 0,
                r: B256::ZERO,
                s: B256::ZERO,
            },
            feeOnTop: crate::reconciler::tests::fee(),
        }
        .abi_encode();
        let transfer = crate::abi::IERC20::transferFromCall {
            from: BUYER,
            to: SELLER,
            value: U256::from(100),
        }
        .abi_encode();
        let trace: CallTrace = call_frame(EXCHANGE, input, vec![call_frame(WETH, transfer, vec![])]);

        let mut traces = StaticTraces::default();
        traces.traces.insert(B256::with_last_byte(2), trace);
        let (handler, _) = handler(traces);

        let accept = classified(
            EventKind::PaymentProcessorAcceptOfferErc721,
            EXCHANGE,
            &IPaymentProcessor::AcceptOfferERC721 {
                seller: SELLER,
                buyer: BUYER,
                tokenAddress: COLLECTION,
                beneficiary: BUYER,
                paymentCoin: WETH,
                tokenId: U256::from(5),
                salePrice: U256::from(100),
            },
            2,
            0,
        );

        let mut data = OnChainData::new();
        handler.handle(&[accept], &mut data).await.expect("handle");

        assert_eq!(data.fill_events.len(), 1);
        assert_eq!(data.fill_events[0].side, OrderSide::Buy);
        assert_eq!(data.fill_events[0].maker, BUYER);
        let triggers = data.maker_state_triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].contract, WETH);
        assert_eq!(triggers[0].operator, Some(EXCHANGE));
    }

    #[tokio::test]
    async fn test_nonce_events() {
        let nonce = classified(
            EventKind::PaymentProcessorNonceInvalidated,
            EXCHANGE,
            &IPaymentProcessor::NonceInvalidated {
                nonce: U256::from(12),
                account: SELLER,
                wasCancellation: true,
            },
            4,
            0,
        );
        let master = classified(
            EventKind::PaymentProcessorMasterNonceInvalidated,
            EXCHANGE,
            &IPaymentProcessor::MasterNonceInvalidated {
                account: SELLER,
                nonce: U256::from(2),
            },
            4,
            1,
        );
        let (handler, _) = handler(StaticTraces::default());
        let mut data = OnChainData::new();
        handler
            .handle(&[nonce, master], &mut data)
            .await
            .expect("no trace needed");

        assert_eq!(data.nonce_invalidations.len(), 1);
        assert!(data.nonce_invalidations[0].was_cancellation);
        assert_eq!(data.bulk_cancel_events[0].min_nonce, U256::from(3));
    }
}
