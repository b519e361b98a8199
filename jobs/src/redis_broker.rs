//! Redis bindings for the broker and the lock service.
//!
//! ## Key layout
//!
//! - `{prefix}:queue:{name}`: sorted set of message ids scored by due time (ms)
//! - `{prefix}:body:{name}`: hash of message id to body
//! - `{prefix}:inflight:{name}`: hash of delivered, unacknowledged messages
//! - `{prefix}:leases:{name}`: sorted set of in-flight ids scored by lease
//!   deadline (ms)
//! - `{prefix}:seq`: message id counter
//! - `{prefix}:lock:{key}`: lock leases (`SET NX PX`)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;
use tracing::debug;

use crate::broker::{Broker, Delivery};
use crate::error::{BrokerError, LockError};
use crate::lock::LockService;

/// Moves the earliest due message into the in-flight hash and leases it
/// until `ARGV[2]`.
const RECEIVE_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return nil
end
local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local body = redis.call('HGET', KEYS[2], id)
redis.call('HDEL', KEYS[2], id)
if not body then
  return nil
end
redis.call('HSET', KEYS[3], id, body)
redis.call('ZADD', KEYS[4], ARGV[2], id)
return {id, body}
";

/// Moves the lease deadline of a delivery that is still in flight.
const TOUCH_SCRIPT: &str = r"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
";

/// Requeues in-flight messages whose lease expired under a fresh id.
const RECOVER_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', ARGV[1])
local recovered = 0
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[4], id)
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    redis.call('HDEL', KEYS[3], id)
    local fresh = redis.call('INCR', KEYS[5])
    redis.call('HSET', KEYS[2], fresh, body)
    redis.call('ZADD', KEYS[1], ARGV[1], fresh)
    recovered = recovered + 1
  end
end
return recovered
";

/// Removes every message of a queue and returns the bodies in due order.
const DRAIN_SCRIPT: &str = r"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
local bodies = {}
for _, id in ipairs(ids) do
  local body = redis.call('HGET', KEYS[2], id)
  if body then
    table.insert(bodies, body)
  end
end
redis.call('DEL', KEYS[1], KEYS[2])
return bodies
";

/// Creates a Redis connection pool.
///
/// # Errors
///
/// Returns an error if the URL is invalid.
pub fn create_pool(redis_url: &str) -> Result<Pool, BrokerError> {
    Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

/// Redis-backed broker with delayed delivery.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    prefix: String,
    receive: Script,
    touch: Script,
    recover: Script,
    drain: Script,
}

impl RedisBroker {
    /// Creates a broker on the pool, namespacing keys with `prefix`.
    #[must_use]
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            receive: Script::new(RECEIVE_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            drain: Script::new(DRAIN_SCRIPT),
        }
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn body_key(&self, queue: &str) -> String {
        format!("{}:body:{}", self.prefix, queue)
    }

    fn inflight_key(&self, queue: &str) -> String {
        format!("{}:inflight:{}", self.prefix, queue)
    }

    fn leases_key(&self, queue: &str) -> String {
        format!("{}:leases:{}", self.prefix, queue)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let id: u64 = redis::cmd("INCR")
            .arg(self.seq_key())
            .query_async(&mut conn)
            .await?;
        let due = now_ms().saturating_add(duration_ms(delay));

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.body_key(queue))
            .arg(id)
            .arg(body)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(queue))
            .arg(due)
            .arg(id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(queue, id, delay_ms = duration_ms(delay), "published message");
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let now = now_ms();
        let taken: Option<(String, Vec<u8>)> = self
            .receive
            .key(self.queue_key(queue))
            .key(self.body_key(queue))
            .key(self.inflight_key(queue))
            .key(self.leases_key(queue))
            .arg(now)
            .arg(now.saturating_add(duration_ms(visibility)))
            .invoke_async(&mut conn)
            .await?;

        Ok(taken.map(|(tag, body)| Delivery {
            queue: queue.to_string(),
            tag,
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.pool.get().await?;
        let (removed, _): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.inflight_key(&delivery.queue))
            .arg(&delivery.tag)
            .cmd("ZREM")
            .arg(self.leases_key(&delivery.queue))
            .arg(&delivery.tag)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(BrokerError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag.clone(),
            });
        }
        Ok(())
    }

    async fn touch(
        &self,
        delivery: &Delivery,
        visibility: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.pool.get().await?;
        let touched: u64 = self
            .touch
            .key(self.inflight_key(&delivery.queue))
            .key(self.leases_key(&delivery.queue))
            .arg(&delivery.tag)
            .arg(now_ms().saturating_add(duration_ms(visibility)))
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.pool.get().await?;
        let recovered: usize = self
            .recover
            .key(self.queue_key(queue))
            .key(self.body_key(queue))
            .key(self.inflight_key(queue))
            .key(self.leases_key(queue))
            .key(self.seq_key())
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if recovered > 0 {
            debug!(queue, recovered, "requeued expired deliveries");
        }
        Ok(recovered)
    }

    async fn drain(&self, queue: &str) -> Result<Vec<Vec<u8>>, BrokerError> {
        let mut conn = self.pool.get().await?;
        let bodies: Vec<Vec<u8>> = self
            .drain
            .key(self.queue_key(queue))
            .key(self.body_key(queue))
            .invoke_async(&mut conn)
            .await?;
        Ok(bodies)
    }

    async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.pool.get().await?;
        let len: usize = redis::cmd("ZCARD")
            .arg(self.queue_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

/// Redis-backed lock service.
#[derive(Clone)]
pub struct RedisLockService {
    pool: Pool,
    prefix: String,
    owner: String,
}

impl RedisLockService {
    /// Creates a lock service; `owner` is stored as the lease value.
    #[must_use]
    pub fn new(pool: Pool, prefix: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            owner: owner.into(),
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(&self.owner)
            .arg("NX")
            .arg("PX")
            .arg(duration_ms(ttl).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        self.set_nx(key, ttl).await
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let extended: u64 = {
            let mut conn = self.pool.get().await?;
            redis::cmd("PEXPIRE")
                .arg(self.lock_key(key))
                .arg(duration_ms(ttl).max(1))
                .query_async(&mut conn)
                .await?
        };
        if extended == 1 {
            return Ok(true);
        }
        self.set_nx(key, ttl).await
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(self.lock_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let pool = create_pool("redis://localhost:6379").expect("pool");
        let broker = RedisBroker::new(pool.clone(), "of");
        assert_eq!(broker.queue_key("orders"), "of:queue:orders");
        assert_eq!(broker.body_key("orders"), "of:body:orders");
        assert_eq!(broker.inflight_key("orders"), "of:inflight:orders");
        assert_eq!(broker.leases_key("orders"), "of:leases:orders");

        let locks = RedisLockService::new(pool, "of", "worker-1");
        assert_eq!(locks.lock_key("orders:1"), "of:lock:orders:1");
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }
}
