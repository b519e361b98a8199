//! Error types for the job runtime.
//!
//! Handler failures, broker failures and lock failures are kept apart so the
//! runtime can treat them differently: handler errors drive retries, broker
//! errors leave deliveries unacknowledged, lock errors are logged and ignored.

use std::time::Duration;

/// Error returned by a job handler attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The handler failed while processing the payload.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The attempt exceeded the queue timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The payload could not be decoded into the handler's input type.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// A broker operation issued by the handler failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl JobError {
    /// Creates a handler error from anything displayable.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }

    /// Returns true if the attempt was aborted by the timeout race.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Connection to the broker could not be established.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A broker command failed.
    #[error("broker command error: {0}")]
    Command(String),

    /// The delivery is unknown to the broker (already acked or expired).
    #[error("unknown delivery {tag} on queue {queue}")]
    UnknownDelivery {
        /// Queue the delivery was taken from.
        queue: String,
        /// Delivery tag.
        tag: String,
    },
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for BrokerError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Lock service errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock backend is unavailable.
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    /// A lock command failed.
    #[error("lock command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for LockError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two handlers declared the same queue name.
    #[error("duplicate handler for queue {0}")]
    DuplicateQueue(String),

    /// No handler is bound to the queue.
    #[error("no handler registered for queue {0}")]
    UnknownQueue(String),
}

/// Errors surfaced by the runtime's polling entry points.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The queue has no registered handler.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A broker call failed; the delivery, if any, stays unacknowledged.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        let err = JobError::handler("rpc unavailable");
        assert_eq!(err.to_string(), "handler failed: rpc unavailable");

        let err = JobError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "job timed out after 5s");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::UnknownDelivery {
            queue: "orders".to_string(),
            tag: "7".to_string(),
        };
        assert_eq!(err.to_string(), "unknown delivery 7 on queue orders");
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::DuplicateQueue("events-sync".to_string());
        assert_eq!(err.to_string(), "duplicate handler for queue events-sync");
    }
}
