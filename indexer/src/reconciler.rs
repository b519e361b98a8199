//! Call-trace reconciliation for Payment Processor fills.
//!
//! Payment Processor events do not carry the order hash. The reconciler
//! decodes the sale entry points found in the transaction's call tree into
//! per-item sale details, pairs them with the fill events of the same
//! transaction and recovers the order id from the seller's EIP-712 signature
//! or, failing that, from the stored `(maker, nonce)` records.

use std::collections::HashSet;
use std::sync::Arc;

use alloy_primitives::{hex, Address, Signature, B256, U256};
use alloy_sol_types::{eip712_domain, Eip712Domain, SolCall, SolStruct};
use tracing::{debug, warn};

use crate::abi::IPaymentProcessor::{
    self, acceptOfferCall, bulkAcceptOffersCall, bulkBuyListingsCall, bulkBuyListingsCosignedCall,
    buyListingCall, buyListingCosignedCall, sweepCollectionCall, sweepCollectionCosignedCall,
};
use crate::abi::{SaleApproval, IERC20};
use crate::error::{DecodeError, StoreError};
use crate::events::log::ProtocolKind;
use crate::events::types::OrderSide;
use crate::store::OrderBookStore;
use crate::trace::CallTrace;

/// Selectors of every sale entry point.
pub const SALE_SELECTORS: [[u8; 4]; 8] = [
    buyListingCall::SELECTOR,
    buyListingCosignedCall::SELECTOR,
    bulkBuyListingsCall::SELECTOR,
    bulkBuyListingsCosignedCall::SELECTOR,
    sweepCollectionCall::SELECTOR,
    sweepCollectionCosignedCall::SELECTOR,
    acceptOfferCall::SELECTOR,
    bulkAcceptOffersCall::SELECTOR,
];

const ERC20_TRANSFER_SELECTORS: [[u8; 4]; 2] = [
    IERC20::transferCall::SELECTOR,
    IERC20::transferFromCall::SELECTOR,
];

/// One item of a decoded sale call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleDetail {
    /// Listing or offer.
    pub side: OrderSide,
    /// Token standard tag of the order.
    pub protocol: u8,
    /// Signer of the order: seller for listings, buyer for offers.
    pub maker: Address,
    /// Receiver of the NFT.
    pub beneficiary: Address,
    /// Marketplace collecting the fee.
    pub marketplace: Address,
    /// Royalty recipient when the collection sets none.
    pub fallback_royalty_recipient: Address,
    /// Payment currency, zero for native.
    pub payment_method: Address,
    /// NFT contract.
    pub token_address: Address,
    /// NFT token id.
    pub token_id: U256,
    /// Units sold.
    pub amount: U256,
    /// Price per order.
    pub item_price: U256,
    /// Order nonce.
    pub nonce: U256,
    /// Order expiration.
    pub expiration: U256,
    /// Marketplace fee.
    pub marketplace_fee_numerator: U256,
    /// Royalty cap.
    pub max_royalty_fee_numerator: U256,
    /// Maker signature, absent when empty.
    pub signature: Option<Signature>,
    /// Cosigner, zero when the order is not cosigned.
    pub cosigner: Address,
}

impl SaleDetail {
    fn from_order(
        side: OrderSide,
        order: &IPaymentProcessor::Order,
        signature: Option<&IPaymentProcessor::SignatureECDSA>,
        cosigner: Address,
    ) -> Self {
        Self {
            side,
            protocol: order.protocol,
            maker: order.maker,
            beneficiary: order.beneficiary,
            marketplace: order.marketplace,
            fallback_royalty_recipient: order.fallbackRoyaltyRecipient,
            payment_method: order.paymentMethod,
            token_address: order.tokenAddress,
            token_id: order.tokenId,
            amount: order.amount,
            item_price: order.itemPrice,
            nonce: order.nonce,
            expiration: order.expiration,
            marketplace_fee_numerator: order.marketplaceFeeNumerator,
            max_royalty_fee_numerator: order.maxRoyaltyFeeNumerator,
            signature: signature.and_then(to_signature),
            cosigner,
        }
    }

    fn from_sweep_item(
        sweep: &IPaymentProcessor::SweepOrder,
        item: &IPaymentProcessor::SweepItem,
        signature: Option<&IPaymentProcessor::SignatureECDSA>,
        cosigner: Address,
    ) -> Self {
        Self {
            side: OrderSide::Sell,
            protocol: sweep.protocol,
            maker: item.maker,
            beneficiary: sweep.beneficiary,
            marketplace: item.marketplace,
            fallback_royalty_recipient: item.fallbackRoyaltyRecipient,
            payment_method: sweep.paymentMethod,
            token_address: sweep.tokenAddress,
            token_id: item.tokenId,
            amount: item.amount,
            item_price: item.itemPrice,
            nonce: item.nonce,
            expiration: item.expiration,
            marketplace_fee_numerator: item.marketplaceFeeNumerator,
            max_royalty_fee_numerator: item.maxRoyaltyFeeNumerator,
            signature: signature.and_then(to_signature),
            cosigner,
        }
    }

    /// Returns the key fill events are matched on.
    #[must_use]
    pub const fn key(&self) -> SaleKey {
        SaleKey {
            token_address: self.token_address,
            token_id: self.token_id,
            payment_method: self.payment_method,
        }
    }

    /// Rebuilds the EIP-712 listing approval the seller signed.
    #[must_use]
    pub const fn sale_approval(&self, master_nonce: U256) -> SaleApproval {
        SaleApproval {
            protocol: self.protocol,
            cosigner: self.cosigner,
            seller: self.maker,
            marketplace: self.marketplace,
            fallbackRoyaltyRecipient: self.fallback_royalty_recipient,
            paymentMethod: self.payment_method,
            tokenAddress: self.token_address,
            tokenId: self.token_id,
            amount: self.amount,
            itemPrice: self.item_price,
            expiration: self.expiration,
            marketplaceFeeNumerator: self.marketplace_fee_numerator,
            maxRoyaltyFeeNumerator: self.max_royalty_fee_numerator,
            nonce: self.nonce,
            masterNonce: master_nonce,
        }
    }
}

fn to_signature(sig: &IPaymentProcessor::SignatureECDSA) -> Option<Signature> {
    if sig.r.is_zero() {
        return None;
    }
    let y_parity = matches!(sig.v, 1 | 28);
    Some(Signature::new(
        U256::from_be_bytes(sig.r.0),
        U256::from_be_bytes(sig.s.0),
        y_parity,
    ))
}

fn cosigner_at(cosignatures: &[IPaymentProcessor::Cosignature], index: usize) -> Address {
    cosignatures
        .get(index)
        .map_or(Address::ZERO, |c| c.signer)
}

/// What a fill event is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaleKey {
    /// NFT contract.
    pub token_address: Address,
    /// NFT token id.
    pub token_id: U256,
    /// Payment currency.
    pub payment_method: Address,
}

/// Decodes a sale entry point into its per-item sale details, in call order.
///
/// # Errors
///
/// Returns an error if the calldata is not a known sale call or fails to
/// decode.
pub fn decode_sale_details(input: &[u8]) -> Result<Vec<SaleDetail>, DecodeError> {
    let selector: [u8; 4] = input
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::MissingSelector)?;

    let details = match selector {
        buyListingCall::SELECTOR => {
            let call = buyListingCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("buyListing", e))?;
            vec![SaleDetail::from_order(
                OrderSide::Sell,
                &call.saleDetails,
                Some(&call.sellerSignature),
                Address::ZERO,
            )]
        }
        buyListingCosignedCall::SELECTOR => {
            let call = buyListingCosignedCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("buyListingCosigned", e))?;
            vec![SaleDetail::from_order(
                OrderSide::Sell,
                &call.saleDetails,
                Some(&call.sellerSignature),
                call.cosignature.signer,
            )]
        }
        bulkBuyListingsCall::SELECTOR => {
            let call = bulkBuyListingsCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("bulkBuyListings", e))?;
            call.saleDetailsArray
                .iter()
                .enumerate()
                .map(|(i, order)| {
                    SaleDetail::from_order(
                        OrderSide::Sell,
                        order,
                        call.sellerSignatures.get(i),
                        Address::ZERO,
                    )
                })
                .collect()
        }
        bulkBuyListingsCosignedCall::SELECTOR => {
            let call = bulkBuyListingsCosignedCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("bulkBuyListingsCosigned", e))?;
            call.saleDetailsArray
                .iter()
                .enumerate()
                .map(|(i, order)| {
                    SaleDetail::from_order(
                        OrderSide::Sell,
                        order,
                        call.sellerSignatures.get(i),
                        cosigner_at(&call.cosignatures, i),
                    )
                })
                .collect()
        }
        sweepCollectionCall::SELECTOR => {
            let call = sweepCollectionCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("sweepCollection", e))?;
            call.items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    SaleDetail::from_sweep_item(
                        &call.sweepOrder,
                        item,
                        call.signedSellOrders.get(i),
                        Address::ZERO,
                    )
                })
                .collect()
        }
        sweepCollectionCosignedCall::SELECTOR => {
            let call = sweepCollectionCosignedCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("sweepCollectionCosigned", e))?;
            call.items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    SaleDetail::from_sweep_item(
                        &call.sweepOrder,
                        item,
                        call.signedSellOrders.get(i),
                        cosigner_at(&call.cosignatures, i),
                    )
                })
                .collect()
        }
        acceptOfferCall::SELECTOR => {
            let call = acceptOfferCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("acceptOffer", e))?;
            vec![SaleDetail::from_order(
                OrderSide::Buy,
                &call.saleDetails,
                Some(&call.buyerSignature),
                call.cosignature.signer,
            )]
        }
        bulkAcceptOffersCall::SELECTOR => {
            let call = bulkAcceptOffersCall::abi_decode(input)
                .map_err(|e| DecodeError::abi("bulkAcceptOffers", e))?;
            call.saleDetailsArray
                .iter()
                .enumerate()
                .map(|(i, order)| {
                    SaleDetail::from_order(
                        OrderSide::Buy,
                        order,
                        call.buyerSignaturesArray.get(i),
                        cosigner_at(&call.cosignaturesArray, i),
                    )
                })
                .collect()
        }
        other => return Err(DecodeError::UnknownSelector(hex::encode(other))),
    };

    Ok(details)
}

/// Pairs fill keys with sale details.
///
/// The i-th key takes detail i when it matches and is still free; otherwise
/// the first free matching detail; otherwise nothing.
#[must_use]
pub fn match_sales(details: &[SaleDetail], keys: &[SaleKey]) -> Vec<Option<usize>> {
    let mut consumed = vec![false; details.len()];
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            let free_match =
                |j: usize| consumed.get(j) == Some(&false) && details.get(j).map(SaleDetail::key) == Some(*key);
            let chosen = if free_match(i) {
                Some(i)
            } else {
                (0..details.len()).find(|&j| free_match(j))
            };
            if let Some(j) = chosen {
                if let Some(slot) = consumed.get_mut(j) {
                    *slot = true;
                }
            }
            chosen
        })
        .collect()
}

/// A sale detail paired with a fill event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledSale {
    /// The decoded sale.
    pub detail: SaleDetail,
    /// Recovered order hash.
    pub order_id: Option<B256>,
}

/// Result of reconciling one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// One entry per fill key; `None` is a reconciliation miss.
    pub sales: Vec<Option<ReconciledSale>>,
    /// Tokens moved by ERC-20 `transfer`/`transferFrom` calls in the trace.
    pub erc20_currencies: HashSet<Address>,
}

impl Reconciliation {
    /// Number of fills left unmatched.
    #[must_use]
    pub fn misses(&self) -> usize {
        self.sales.iter().filter(|s| s.is_none()).count()
    }
}

/// Reconciles Payment Processor fills against call traces.
pub struct Reconciler {
    exchange: Address,
    domain: Eip712Domain,
    nonce_lookback: u64,
    store: Arc<dyn OrderBookStore>,
}

impl Reconciler {
    /// Creates a reconciler for the exchange deployed at `exchange`.
    #[must_use]
    pub fn new(
        exchange: Address,
        chain_id: u64,
        nonce_lookback: u64,
        store: Arc<dyn OrderBookStore>,
    ) -> Self {
        let domain = eip712_domain! {
            name: "PaymentProcessor",
            version: "2",
            chain_id: chain_id,
            verifying_contract: exchange,
        };
        Self {
            exchange,
            domain,
            nonce_lookback,
            store,
        }
    }

    /// Returns the exchange address.
    #[must_use]
    pub const fn exchange(&self) -> Address {
        self.exchange
    }

    /// Returns the sale calls into the exchange, depth-first.
    #[must_use]
    pub fn sale_calls<'a>(&self, trace: &'a CallTrace) -> Vec<&'a CallTrace> {
        trace
            .flatten()
            .into_iter()
            .filter(|frame| frame.to == Some(self.exchange) && frame.is_call())
            .filter(|frame| {
                frame
                    .selector()
                    .is_some_and(|selector| SALE_SELECTORS.contains(&selector))
            })
            .collect()
    }

    /// Decodes every sale call in the trace. Undecodable calls are skipped.
    #[must_use]
    pub fn sale_details(&self, trace: &CallTrace) -> Vec<SaleDetail> {
        let mut details = Vec::new();
        for call in self.sale_calls(trace) {
            match decode_sale_details(&call.input) {
                Ok(decoded) => details.extend(decoded),
                Err(e) => warn!(error = %e, "skipping undecodable sale call"),
            }
        }
        details
    }

    /// Returns the EIP-712 signing hash of a listing under `master_nonce`.
    #[must_use]
    pub fn listing_hash(&self, detail: &SaleDetail, master_nonce: U256) -> B256 {
        detail
            .sale_approval(master_nonce)
            .eip712_signing_hash(&self.domain)
    }

    /// Recovers the order id of a sale.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookups fail.
    pub async fn recover_order_id(&self, detail: &SaleDetail) -> Result<Option<B256>, StoreError> {
        if detail.side == OrderSide::Sell {
            if let Some(signature) = &detail.signature {
                let current = self
                    .store
                    .master_nonce(ProtocolKind::PaymentProcessorV2, detail.maker)
                    .await?;
                let candidates =
                    (0..self.nonce_lookback).map_while(|step| current.checked_sub(U256::from(step)));
                for master_nonce in candidates {
                    let hash = self.listing_hash(detail, master_nonce);
                    match signature.recover_address_from_prehash(&hash) {
                        Ok(signer) if signer == detail.maker => return Ok(Some(hash)),
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "seller signature does not recover");
                            break;
                        }
                    }
                }
            }
        }

        self.store
            .find_order_id(ProtocolKind::PaymentProcessorV2, detail.maker, detail.nonce)
            .await
    }

    /// Reconciles the fill keys of one transaction against its call trace.
    ///
    /// # Errors
    ///
    /// Returns an error if an order-id lookup fails.
    pub async fn reconcile(
        &self,
        trace: &CallTrace,
        keys: &[SaleKey],
    ) -> Result<Reconciliation, StoreError> {
        let details = self.sale_details(trace);
        let matches = match_sales(&details, keys);

        let mut sales = Vec::with_capacity(keys.len());
        for matched in matches {
            let Some(detail) = matched.and_then(|j| details.get(j)) else {
                sales.push(None);
                continue;
            };
            let order_id = self.recover_order_id(detail).await?;
            sales.push(Some(ReconciledSale {
                detail: detail.clone(),
                order_id,
            }));
        }

        let erc20_currencies = trace
            .flatten()
            .into_iter()
            .filter(|frame| frame.is_call())
            .filter(|frame| {
                frame
                    .selector()
                    .is_some_and(|selector| ERC20_TRANSFER_SELECTORS.contains(&selector))
            })
            .filter_map(|frame| frame.to)
            .collect();

        Ok(Reconciliation {
            sales,
            erc20_currencies,
        })
    }
}
