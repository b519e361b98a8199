//! Orderflow Indexer - On-chain event aggregation and order reconciliation.
//!
//! Block ranges are fetched from a JSON-RPC node, classified by event
//! signature, decoded by per-protocol handlers into mutation records and
//! committed to the order book. Every stage runs as a job on the
//! `orderflow-jobs` runtime.
//!
//! # Components
//!
//! - [`abi`]: Solidity bindings of the indexed contracts
//! - [`config`]: Indexer configuration
//! - [`events`]: Logs, classifier, mutation records and the batch processor
//! - [`handlers`]: Protocol handlers
//! - [`reconciler`]: Call-trace reconciliation of Payment Processor fills
//! - [`swap`]: Swap detection
//! - [`trace`]: Call traces
//! - [`commit`]: Commit stage
//! - [`store`]: Order-book persistence
//! - [`jobs`]: Job handlers and queue declarations
//! - [`sync`]: Realtime sync poller
//! - [`rpc`]: JSON-RPC client
//! - [`service`]: Service wiring

pub mod abi;
pub mod commit;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod reconciler;
pub mod rpc;
pub mod service;
pub mod store;
pub mod swap;
pub mod sync;
pub mod trace;

pub use commit::{CommitStage, CommitSummary};
pub use config::{ConfigError, IndexerConfig, ProtocolAddresses};
pub use error::{DecodeError, IndexerError, StoreError, TraceError};
pub use events::{EventProcessor, LogClassifier, OnChainData, RawLog};
pub use handlers::{ProtocolDispatch, ProtocolHandler};
pub use jobs::{
    CollectionRecomputeJob, CollectionRecomputePayload, EventsSyncJob, OrderUpdatePayload,
    OrderUpdatesJob,
};
pub use reconciler::Reconciler;
pub use rpc::JsonRpcClient;
pub use service::{ChainProviders, IndexerService, ServiceError};
pub use store::{InMemoryOrderBookStore, OrderBookStore, PgOrderBookStore};
pub use swap::TransactionProvider;
pub use sync::{LogProvider, SyncPoller};
pub use trace::TraceProvider;
