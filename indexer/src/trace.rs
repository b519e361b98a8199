//! Transaction call traces.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TraceError;

/// One frame of a `callTracer` call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    /// Frame type: `CALL`, `STATICCALL`, `DELEGATECALL`, `CREATE`...
    #[serde(rename = "type")]
    pub kind: String,
    /// Caller.
    pub from: Address,
    /// Callee, absent for failed creates.
    #[serde(default)]
    pub to: Option<Address>,
    /// Calldata.
    #[serde(default)]
    pub input: Bytes,
    /// Value sent.
    #[serde(default)]
    pub value: Option<U256>,
    /// Nested frames.
    #[serde(default, rename = "calls", alias = "children")]
    pub children: Vec<CallTrace>,
}

impl CallTrace {
    /// Returns true for plain `CALL` frames.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.kind.eq_ignore_ascii_case("call")
    }

    /// Returns the 4-byte selector of the calldata.
    #[must_use]
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.input.get(..4).and_then(|s| s.try_into().ok())
    }

    /// Returns every frame in depth-first pre-order, root first.
    #[must_use]
    pub fn flatten(&self) -> Vec<&Self> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(frame) = stack.pop() {
            out.push(frame);
            stack.extend(frame.children.iter().rev());
        }
        out
    }
}

/// Source of transaction call trees.
#[async_trait]
pub trait TraceProvider: Send + Sync {
    /// Returns the call tree of a transaction.
    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallTrace, TraceError>;
}
