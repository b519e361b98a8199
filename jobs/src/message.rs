//! The job envelope carried on the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for one logical job.
///
/// The payload is opaque to the runtime. `retry_count` only ever grows
/// across redeliveries of the same logical job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    /// Handler-specific payload.
    pub payload: Value,

    /// Dedup/lock key, scoped by queue name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,

    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,

    /// When the last attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the job completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobMessage {
    /// Creates a fresh message for the payload.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            job_id: None,
            retry_count: 0,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
        }
    }

    /// Sets the dedup/lock key.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Decodes a message from a broker body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a valid envelope.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Encodes the message into a broker body.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Returns true once the retry budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count > max_retries
    }

    /// Returns the lock key for this message on the given queue.
    #[must_use]
    pub fn lock_key(&self, queue: &str) -> Option<String> {
        self.job_id.as_ref().map(|id| lock_key(queue, id))
    }
}

/// Builds the lock key used for a job id on a queue.
#[must_use]
pub fn lock_key(queue: &str, job_id: &str) -> String {
    format!("{queue}:{job_id}")
}
