//! Broker boundary.
//!
//! The runtime only needs a handful of primitives from a broker: delayed
//! publish, receive with explicit acknowledgement, and draining a queue for
//! dead-letter replays. Dead-letter queues are plain queues.
//!
//! A received message is leased, not removed. Until it is acknowledged it
//! sits in flight with a deadline; once the deadline passes, [`Broker::recover`]
//! puts it back on its queue so another consumer picks it up.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::BrokerError;

/// A message handed out by the broker and awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was received from.
    pub queue: String,
    /// Broker-assigned delivery tag.
    pub tag: String,
    /// Raw message body.
    pub body: Vec<u8>,
}

/// Durable publish/subscribe primitive.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a body, visible to consumers after `delay`.
    async fn publish(&self, queue: &str, body: Vec<u8>, delay: Duration)
        -> Result<(), BrokerError>;

    /// Takes the next due message, if any, leased for `visibility`.
    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a delivery, removing it for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Pushes a delivery's lease deadline to `visibility` from now.
    ///
    /// Returns false if the lease already expired and the message went back
    /// to its queue.
    async fn touch(&self, delivery: &Delivery, visibility: Duration)
        -> Result<bool, BrokerError>;

    /// Returns every in-flight message of a queue whose lease expired to the
    /// queue, due immediately. Returns how many were recovered.
    async fn recover(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Removes and returns every message of a queue, due or not.
    async fn drain(&self, queue: &str) -> Result<Vec<Vec<u8>>, BrokerError>;

    /// Number of messages waiting in a queue.
    async fn len(&self, queue: &str) -> Result<usize, BrokerError>;
}

#[derive(Debug)]
struct Leased {
    seq: u64,
    body: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: BTreeMap<(Instant, u64), Vec<u8>>,
    in_flight: HashMap<String, Leased>,
}

/// In-process broker.
///
/// Messages are ordered by due time, then by publish order. Uses the tokio
/// clock so paused-time tests can fast-forward through delays.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    seq: AtomicU64,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered but unacknowledged messages on a queue.
    pub async fn in_flight(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |q| q.in_flight.len())
    }

    /// Returns the bodies waiting in a queue without consuming them.
    pub async fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.ready.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .ready
            .insert((due, seq), body);
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        let due_key = match state.ready.keys().next() {
            Some(key) if key.0 <= now => *key,
            _ => return Ok(None),
        };

        let Some(body) = state.ready.remove(&due_key) else {
            return Ok(None);
        };
        let tag = due_key.1.to_string();
        state.in_flight.insert(
            tag.clone(),
            Leased {
                seq: due_key.1,
                body: body.clone(),
                deadline: now + visibility,
            },
        );

        Ok(Some(Delivery {
            queue: queue.to_string(),
            tag,
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let removed = queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.in_flight.remove(&delivery.tag));

        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag.clone(),
            }),
        }
    }

    async fn touch(
        &self,
        delivery: &Delivery,
        visibility: Duration,
    ) -> Result<bool, BrokerError> {
        let mut queues = self.queues.lock().await;
        let leased = queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.in_flight.get_mut(&delivery.tag));

        Ok(match leased {
            Some(leased) => {
                leased.deadline = Instant::now() + visibility;
                true
            }
            None => false,
        })
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let now = Instant::now();
        let mut expired: Vec<(u64, String)> = state
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.deadline <= now)
            .map(|(tag, leased)| (leased.seq, tag.clone()))
            .collect();
        expired.sort_unstable();

        // A fresh tag per redelivery keeps a late ack of the old one out.
        for (_, tag) in &expired {
            if let Some(leased) = state.in_flight.remove(tag) {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                state.ready.insert((now, seq), leased.body);
            }
        }
        Ok(expired.len())
    }

    async fn drain(&self, queue: &str) -> Result<Vec<Vec<u8>>, BrokerError> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(queue)
            .map(|q| std::mem::take(&mut q.ready).into_values().collect())
            .unwrap_or_default())
    }

    async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |q| q.ready.len()))
    }
}
