//! Orderflow Jobs - Broker-backed background job runtime.
//!
//! Every background unit of work is a [`JobHandler`] bound to one queue by a
//! static [`QueueDescriptor`]. The runtime gives all of them the same
//! guarantees: at-least-once execution, bounded retries with backoff,
//! per-job distributed locks, per-attempt timeouts, priority scheduling and
//! dead-letter escalation.
//!
//! # Components
//!
//! - [`broker`]: Broker boundary and in-memory binding
//! - [`redis_broker`]: Redis broker and lock bindings
//! - [`lock`]: Lease-based lock service
//! - [`descriptor`]: Queue declarations and backoff policies
//! - [`handler`]: Job handler contract
//! - [`registry`]: Handler registry
//! - [`queue`]: Job producer
//! - [`runtime`]: Worker pools and the consume algorithm
//! - [`sweep`]: Scheduled dead-letter replay
//! - [`metrics`]: Job metrics

pub mod broker;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod lock;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod redis_broker;
pub mod registry;
pub mod runtime;
pub mod sweep;

pub use broker::{Broker, Delivery, InMemoryBroker};
pub use config::{ConfigError, RuntimeConfig};
pub use descriptor::{Backoff, QueueClass, QueueDescriptor};
pub use error::{BrokerError, JobError, LockError, RegistryError, RuntimeError};
pub use handler::{decode_payload, JobHandler};
pub use lock::{InMemoryLockService, LockService, LockTable};
pub use message::JobMessage;
pub use metrics::{JobMetrics, JobMetricsSnapshot};
pub use queue::{JobQueue, SendOptions, SendOutcome};
pub use redis_broker::{create_pool, RedisBroker, RedisLockService};
pub use registry::HandlerRegistry;
pub use runtime::{ConsumeOutcome, JobRuntime};
pub use sweep::{DeadLetterSweeper, SweepOutcome};
