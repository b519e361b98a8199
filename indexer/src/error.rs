//! Error types for the indexer.

use alloy_primitives::B256;

/// A log or calldata blob could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// ABI decoding failed.
    #[error("abi decode failed for {what}: {reason}")]
    Abi {
        /// What was being decoded.
        what: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// Calldata is shorter than a selector.
    #[error("calldata too short")]
    MissingSelector,

    /// The selector is not one of the known sale entry points.
    #[error("unknown selector 0x{0}")]
    UnknownSelector(String),
}

impl DecodeError {
    pub(crate) fn abi(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Abi {
            what,
            reason: err.to_string(),
        }
    }
}

/// Errors from the chain providers (traces, logs, transactions).
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Transport failure.
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node returned a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The response could not be interpreted.
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    /// The node has no data for the transaction.
    #[error("transaction {0} not found")]
    NotFound(B256),
}

/// Order-book store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be converted back.
    #[error("corrupt column {column}: {reason}")]
    Corrupt {
        /// Column name.
        column: &'static str,
        /// Conversion failure.
        reason: String,
    },
}

/// Top-level indexer errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    /// Decode failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Provider failure.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Follow-on job could not be enqueued.
    #[error(transparent)]
    Broker(#[from] orderflow_jobs::BrokerError),

    /// One or more protocol handlers failed within a batch.
    #[error("protocol handlers failed: {0}")]
    PartialBatch(String),
}

impl From<IndexerError> for orderflow_jobs::JobError {
    fn from(err: IndexerError) -> Self {
        Self::handler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnknownSelector("deadbeef".to_string());
        assert_eq!(err.to_string(), "unknown selector 0xdeadbeef");

        let err = DecodeError::abi("OrderFulfilled", "buffer overrun");
        assert_eq!(
            err.to_string(),
            "abi decode failed for OrderFulfilled: buffer overrun"
        );
    }

    #[test]
    fn test_indexer_error_into_job_error() {
        let err: orderflow_jobs::JobError =
            IndexerError::PartialBatch("seaport".to_string()).into();
        assert_eq!(
            err.to_string(),
            "handler failed: protocol handlers failed: seaport"
        );
    }
}
