//! Swap detection over a transaction's fungible transfers.

use std::collections::HashSet;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;
use crate::events::types::{FungibleTransfer, Swap};

/// The fields of a transaction the swap classifier needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction hash.
    pub hash: B256,
    /// Sender.
    pub from: Address,
    /// Recipient, absent for contract creation.
    pub to: Option<Address>,
    /// Native value sent.
    pub value: U256,
}

/// Source of transaction envelopes.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    /// Returns a transaction by hash.
    async fn transaction(&self, tx_hash: B256) -> Result<TransactionInfo, TraceError>;
}

/// Classifies a transaction as a swap.
///
/// `transfers` are the transaction's fungible legs in log order. A non-zero
/// native value is only accepted when the transaction targets a relay solver;
/// the value then becomes a leading native leg from the sender. The first
/// leg must leave the sender, the last must return to it, and the two
/// currencies must differ.
#[must_use]
pub fn detect_swap(
    tx: &TransactionInfo,
    transfers: &[FungibleTransfer],
    relay_solvers: &HashSet<Address>,
) -> Option<Swap> {
    let first = transfers.first()?;
    let last = transfers.last()?;

    let (from_currency, from_amount) = if tx.value.is_zero() {
        if transfers.len() < 2 || first.from != tx.from {
            return None;
        }
        (first.currency, first.amount)
    } else {
        let to_solver = tx.to.is_some_and(|to| relay_solvers.contains(&to));
        if !to_solver {
            return None;
        }
        (Address::ZERO, tx.value)
    };

    if last.to != tx.from || from_currency == last.currency {
        return None;
    }

    Some(Swap {
        ctx: first.ctx,
        wallet: tx.from,
        from_currency,
        from_amount,
        to_currency: last.currency,
        to_amount: last.amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::tests::ctx;

    const A: Address = Address::repeat_byte(0x0a);
    const B: Address = Address::repeat_byte(0x0b);
    const TOKEN_X: Address = Address::repeat_byte(0x58);
    const TOKEN_Y: Address = Address::repeat_byte(0x59);
    const SOLVER: Address = Address::repeat_byte(0x50);

    fn transfer(from: Address, to: Address, currency: Address, amount: u64) -> FungibleTransfer {
        FungibleTransfer {
            ctx: ctx(1, 0),
            from,
            to,
            currency,
            amount: U256::from(amount),
        }
    }

    fn tx(to: Address, value: u64) -> TransactionInfo {
        TransactionInfo {
            hash: B256::with_last_byte(1),
            from: A,
            to: Some(to),
            value: U256::from(value),
        }
    }

    fn legs() -> Vec<FungibleTransfer> {
        vec![
            transfer(A, B, TOKEN_X, 10),
            transfer(B, A, TOKEN_Y, 5),
        ]
    }

    #[test]
    fn test_detects_token_swap() {
        let swap = detect_swap(&tx(B, 0), &legs(), &HashSet::new()).expect("swap");
        assert_eq!(swap.wallet, A);
        assert_eq!(swap.from_currency, TOKEN_X);
        assert_eq!(swap.from_amount, U256::from(10));
        assert_eq!(swap.to_currency, TOKEN_Y);
        assert_eq!(swap.to_amount, U256::from(5));
    }

    #[test]
    fn test_unmatched_value_is_not_a_swap() {
        assert!(detect_swap(&tx(B, 1), &legs(), &HashSet::new()).is_none());
    }

    #[test]
    fn test_relay_solver_value_becomes_native_leg() {
        let solvers: HashSet<Address> = [SOLVER].into_iter().collect();
        let transfers = vec![transfer(SOLVER, A, TOKEN_Y, 7)];

        let swap = detect_swap(&tx(SOLVER, 3), &transfers, &solvers).expect("swap");
        assert_eq!(swap.from_currency, Address::ZERO);
        assert_eq!(swap.from_amount, U256::from(3));
        assert_eq!(swap.to_currency, TOKEN_Y);
    }

    #[test]
    fn test_same_currency_or_wrong_recipient_rejected() {
        let round_trip = vec![
            transfer(A, B, TOKEN_X, 10),
            transfer(B, A, TOKEN_X, 9),
        ];
        assert!(detect_swap(&tx(B, 0), &round_trip, &HashSet::new()).is_none());

        let outbound = vec![
            transfer(A, B, TOKEN_X, 10),
            transfer(B, SOLVER, TOKEN_Y, 5),
        ];
        assert!(detect_swap(&tx(B, 0), &outbound, &HashSet::new()).is_none());

        assert!(detect_swap(&tx(B, 0), &legs()[..1], &HashSet::new()).is_none());
    }
}
