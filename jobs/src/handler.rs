//! The job handler contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::QueueDescriptor;
use crate::error::JobError;
use crate::message::JobMessage;

/// A typed unit of background work bound to one queue.
///
/// The runtime calls [`JobHandler::process`] for live messages and
/// [`JobHandler::process_dead_letter`] for messages whose retry budget is
/// spent. Errors returned from the hooks are logged and otherwise ignored.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Returns the queue declaration of this handler.
    fn descriptor(&self) -> &QueueDescriptor;

    /// Processes one payload.
    async fn process(&self, payload: &Value) -> Result<Value, JobError>;

    /// Processes a payload replayed from the dead-letter queue.
    async fn process_dead_letter(&self, payload: &Value) -> Result<Value, JobError> {
        self.process(payload).await
    }

    /// Called after a successful attempt.
    async fn on_completed(&self, _message: &JobMessage, _result: &Value) -> Result<(), JobError> {
        Ok(())
    }

    /// Called after a failed attempt, before the retry is scheduled.
    async fn on_error(&self, _message: &JobMessage, _error: &JobError) -> Result<(), JobError> {
        Ok(())
    }
}

/// Decodes a handler payload into a typed value.
///
/// # Errors
///
/// Returns [`JobError::InvalidPayload`] if the value does not match `T`.
pub fn decode_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, JobError> {
    Ok(T::deserialize(payload)?)
}
