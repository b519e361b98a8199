//! Seaport handler.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{balance_trigger, decode, order_trigger, ProtocolHandler};
use crate::abi::{item_type, ISeaport};
use crate::error::{DecodeError, IndexerError};
use crate::events::accumulator::OnChainData;
use crate::events::log::{ClassifiedEvent, EventContext, EventKind, ProtocolKind, RawLog};
use crate::events::types::{BulkCancelEvent, CancelEvent, FillEvent, OrderSide};

/// Decodes Seaport fills, cancellations and counter increments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeaportHandler;

impl SeaportHandler {
    /// Creates the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn on_fulfilled(log: &RawLog, data: &mut OnChainData) -> Result<(), DecodeError> {
        let event: ISeaport::OrderFulfilled = decode(log)?;
        let ctx = log.context();

        let Some(fill) = fill_from(&event, ctx) else {
            debug!(order = %event.orderHash, tx = %ctx.tx_hash, "fulfilment without nft, skipping");
            return Ok(());
        };

        if fill.side == OrderSide::Buy && fill.currency != Address::ZERO {
            data.add_maker_trigger(balance_trigger(ctx, fill.maker, fill.currency));
        }
        data.order_triggers.push(order_trigger(ctx, event.orderHash));
        data.fill_events.push(fill);
        Ok(())
    }

    fn on_cancelled(log: &RawLog, data: &mut OnChainData) -> Result<(), DecodeError> {
        let event: ISeaport::OrderCancelled = decode(log)?;
        let ctx = log.context();
        data.cancel_events.push(CancelEvent {
            ctx,
            protocol: ProtocolKind::Seaport,
            order_id: event.orderHash,
            maker: event.offerer,
        });
        data.order_triggers.push(order_trigger(ctx, event.orderHash));
        Ok(())
    }

    fn on_counter_incremented(log: &RawLog, data: &mut OnChainData) -> Result<(), DecodeError> {
        let event: ISeaport::CounterIncremented = decode(log)?;
        data.bulk_cancel_events.push(BulkCancelEvent {
            ctx: log.context(),
            protocol: ProtocolKind::Seaport,
            maker: event.offerer,
            min_nonce: event.newCounter,
        });
        Ok(())
    }
}

/// Builds the fill of an `OrderFulfilled` event.
///
/// The order is a listing when its offer carries the NFT and a bid when the
/// NFT sits in the consideration. Orders moving no NFT yield nothing.
fn fill_from(
    event: &ISeaport::OrderFulfilled,
    ctx: EventContext,
) -> Option<FillEvent> {
    let offered_nft = event.offer.iter().find(|item| item_type::is_nft(item.itemType));

    if let Some(nft) = offered_nft {
        let currency = event
            .consideration
            .iter()
            .find(|item| item_type::is_fungible(item.itemType))
            .map_or(Address::ZERO, |item| item.token);
        let price = event
            .consideration
            .iter()
            .filter(|item| item_type::is_fungible(item.itemType) && item.token == currency)
            .fold(U256::ZERO, |acc, item| acc.saturating_add(item.amount));

        return Some(FillEvent {
            ctx,
            protocol: ProtocolKind::Seaport,
            order_id: Some(event.orderHash),
            side: OrderSide::Sell,
            maker: event.offerer,
            taker: event.recipient,
            contract: nft.token,
            token_id: nft.identifier,
            amount: nft.amount,
            price,
            currency,
        });
    }

    let payment = event
        .offer
        .iter()
        .find(|item| item_type::is_fungible(item.itemType))?;
    let nft = event
        .consideration
        .iter()
        .find(|item| item_type::is_nft(item.itemType))?;

    Some(FillEvent {
        ctx,
        protocol: ProtocolKind::Seaport,
        order_id: Some(event.orderHash),
        side: OrderSide::Buy,
        maker: event.offerer,
        taker: event.recipient,
        contract: nft.token,
        token_id: nft.identifier,
        amount: nft.amount,
        price: payment.amount,
        currency: payment.token,
    })
}

#[async_trait]
impl ProtocolHandler for SeaportHandler {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Seaport
    }

    async fn handle(
        &self,
        events: &[ClassifiedEvent],
        data: &mut OnChainData,
    ) -> Result<(), IndexerError> {
        for event in events {
            let result = match event.kind {
                EventKind::SeaportOrderFulfilled => Self::on_fulfilled(&event.log, data),
                EventKind::SeaportOrderCancelled => Self::on_cancelled(&event.log, data),
                EventKind::SeaportCounterIncremented => {
                    Self::on_counter_incremented(&event.log, data)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(
                    tx = %event.log.tx_hash,
                    log_index = event.log.log_index,
                    error = %e,
                    "skipping undecodable seaport log"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ISeaport::{ReceivedItem, SpentItem};
    use crate::events::types::TriggerKind;
    use crate::handlers::tests::classified;
    use alloy_primitives::B256;

    const SEAPORT: Address = Address::repeat_byte(0x5a);
    const OFFERER: Address = Address::repeat_byte(0x0f);
    const FULFILLER: Address = Address::repeat_byte(0xf0);
    const NFT: Address = Address::repeat_byte(0xcc);
    const WETH: Address = Address::repeat_byte(0xee);

    fn spent(item_type: u8, token: Address, identifier: u64, amount: u64) -> SpentItem {
        SpentItem {
            itemType: item_type,
            token,
            identifier: U256::from(identifier),
            amount: U256::from(amount),
        }
    }

    fn received(item_type: u8, token: Address, identifier: u64, amount: u64) -> ReceivedItem {
        ReceivedItem {
            itemType: item_type,
            token,
            identifier: U256::from(identifier),
            amount: U256::from(amount),
            recipient: OFFERER,
        }
    }

    fn fulfilled(offer: Vec<SpentItem>, consideration: Vec<ReceivedItem>) -> ClassifiedEvent {
        classified(
            EventKind::SeaportOrderFulfilled,
            SEAPORT,
            &ISeaport::OrderFulfilled {
                orderHash: B256::repeat_byte(0xab),
                offerer: OFFERER,
                zone: Address::ZERO,
                recipient: FULFILLER,
                offer,
                consideration,
            },
            1,
            4,
        )
    }

    #[tokio::test]
    async fn test_listing_fill_sums_consideration() {
        let event = fulfilled(
            vec![spent(item_type::ERC721, NFT, 7, 1)],
            vec![
                received(item_type::NATIVE, Address::ZERO, 0, 950),
                received(item_type::NATIVE, Address::ZERO, 0, 50),
            ],
        );
        let mut data = OnChainData::new();
        SeaportHandler::new()
            .handle(&[event], &mut data)
            .await
            .expect("handle");

        assert_eq!(data.fill_events.len(), 1);
        let fill = &data.fill_events[0];
        assert_eq!(fill.side, OrderSide::Sell);
        assert_eq!(fill.maker, OFFERER);
        assert_eq!(fill.taker, FULFILLER);
        assert_eq!(fill.token_id, U256::from(7));
        assert_eq!(fill.price, U256::from(1000));
        assert_eq!(fill.order_id, Some(B256::repeat_byte(0xab)));
        assert_eq!(data.order_triggers.len(), 1);
        assert!(data.maker_state_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_bid_fill_triggers_maker_balance() {
        let event = fulfilled(
            vec![spent(item_type::ERC20, WETH, 0, 500)],
            vec![received(item_type::ERC721, NFT, 3, 1)],
        );
        let mut data = OnChainData::new();
        SeaportHandler::new()
            .handle(&[event], &mut data)
            .await
            .expect("handle");

        let fill = &data.fill_events[0];
        assert_eq!(fill.side, OrderSide::Buy);
        assert_eq!(fill.currency, WETH);
        assert_eq!(fill.price, U256::from(500));

        let triggers = data.maker_state_triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].maker, OFFERER);
        assert_eq!(triggers[0].contract, WETH);
        assert_eq!(triggers[0].kind, TriggerKind::Balance);
    }

    #[tokio::test]
    async fn test_fungible_only_fulfilment_skipped() {
        let event = fulfilled(
            vec![spent(item_type::ERC20, WETH, 0, 500)],
            vec![received(item_type::NATIVE, Address::ZERO, 0, 500)],
        );
        let mut data = OnChainData::new();
        SeaportHandler::new()
            .handle(&[event], &mut data)
            .await
            .expect("handle");
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_counter() {
        let cancel = classified(
            EventKind::SeaportOrderCancelled,
            SEAPORT,
            &ISeaport::OrderCancelled {
                orderHash: B256::repeat_byte(0xcd),
                offerer: OFFERER,
                zone: Address::ZERO,
            },
            2,
            0,
        );
        let counter = classified(
            EventKind::SeaportCounterIncremented,
            SEAPORT,
            &ISeaport::CounterIncremented {
                newCounter: U256::from(4),
                offerer: OFFERER,
            },
            2,
            1,
        );
        let mut data = OnChainData::new();
        SeaportHandler::new()
            .handle(&[cancel, counter], &mut data)
            .await
            .expect("handle");

        assert_eq!(data.cancel_events.len(), 1);
        assert_eq!(data.cancel_events[0].order_id, B256::repeat_byte(0xcd));
        assert_eq!(data.bulk_cancel_events.len(), 1);
        assert_eq!(data.bulk_cancel_events[0].min_nonce, U256::from(4));
    }

    #[tokio::test]
    async fn test_undecodable_log_skipped() {
        let mut broken = fulfilled(vec![], vec![]);
        broken.log.data = alloy_primitives::Bytes::from_static(&[1, 2, 3]);
        let cancel = classified(
            EventKind::SeaportOrderCancelled,
            SEAPORT,
            &ISeaport::OrderCancelled {
                orderHash: B256::repeat_byte(0xcd),
                offerer: OFFERER,
                zone: Address::ZERO,
            },
            2,
            0,
        );

        let mut data = OnChainData::new();
        SeaportHandler::new()
            .handle(&[broken, cancel], &mut data)
            .await
            .expect("decode failures are not fatal");
        assert_eq!(data.cancel_events.len(), 1);
    }
}
