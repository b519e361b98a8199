//! Best-effort distributed locks.
//!
//! Locks are leases keyed by a logical job, not by a replica: whoever holds
//! the key holds the job. Every call returns a `Result`; callers in the
//! runtime log failures and carry on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::LockError;

/// Lease-based lock service.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes the lock if it is free. Returns false if it is already held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Extends the lease, taking the lock again if it has lapsed.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Releases the lock. Returns false if nothing was held.
    async fn release(&self, key: &str) -> Result<bool, LockError>;
}

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Lock table shared by in-memory lock services.
///
/// Several services built on one table behave like replicas talking to the
/// same lock backend.
#[derive(Debug, Default)]
pub struct LockTable {
    leases: Mutex<HashMap<String, Lease>>,
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-process lock service.
#[derive(Debug, Clone)]
pub struct InMemoryLockService {
    table: Arc<LockTable>,
    owner: String,
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockService {
    /// Creates a service with its own table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_table(LockTable::new(), "local")
    }

    /// Creates a service on a shared table.
    #[must_use]
    pub fn with_table(table: Arc<LockTable>, owner: impl Into<String>) -> Self {
        Self {
            table,
            owner: owner.into(),
        }
    }

    /// Returns true if the key is held and not expired.
    pub async fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.table
            .leases
            .lock()
            .await
            .get(key)
            .is_some_and(|l| l.expires_at > now)
    }

    /// Returns the owner recorded for a held key.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.table
            .leases
            .lock()
            .await
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.table.leases.lock().await;
        if leases.get(key).is_some_and(|l| l.expires_at > now) {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: self.owner.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.table.leases.lock().await;
        match leases.get_mut(key) {
            Some(lease) if lease.expires_at > now => {
                lease.expires_at = now + ttl;
            }
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        owner: self.owner.clone(),
                        expires_at: now + ttl,
                    },
                );
            }
        }
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.table.leases.lock().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_acquire_is_exclusive() {
        let locks = InMemoryLockService::new();
        let ttl = Duration::from_secs(60);

        assert!(locks.acquire("k", ttl).await.expect("acquire"));
        assert!(!locks.acquire("k", ttl).await.expect("acquire"));
        assert!(locks.is_held("k").await);

        assert!(locks.release("k").await.expect("release"));
        assert!(!locks.release("k").await.expect("release"));
        assert!(locks.acquire("k", ttl).await.expect("acquire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let locks = InMemoryLockService::new();
        assert!(locks
            .acquire("k", Duration::from_secs(1))
            .await
            .expect("acquire"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!locks.is_held("k").await);
        assert!(locks
            .acquire("k", Duration::from_secs(1))
            .await
            .expect("acquire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_extend_refreshes_and_reacquires() {
        let locks = InMemoryLockService::new();
        let ttl = Duration::from_secs(10);
        locks.acquire("k", ttl).await.expect("acquire");

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(locks.extend("k", ttl).await.expect("extend"));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(locks.is_held("k").await);

        assert!(locks.extend("fresh", ttl).await.expect("extend"));
        assert!(locks.is_held("fresh").await);
    }

    #[tokio::test]
    async fn test_lock_shared_table_across_replicas() {
        let table = LockTable::new();
        let a = InMemoryLockService::with_table(Arc::clone(&table), "a");
        let b = InMemoryLockService::with_table(table, "b");
        let ttl = Duration::from_secs(30);

        assert!(a.acquire("sweep:q", ttl).await.expect("acquire"));
        assert!(!b.acquire("sweep:q", ttl).await.expect("acquire"));
        assert_eq!(b.holder("sweep:q").await.as_deref(), Some("a"));
    }
}
