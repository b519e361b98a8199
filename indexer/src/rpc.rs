//! JSON-RPC chain client.
//!
//! One `reqwest` client serves logs, transactions and call traces.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::TraceError;
use crate::events::cursor::BlockRange;
use crate::events::log::RawLog;
use crate::swap::{TransactionInfo, TransactionProvider};
use crate::sync::LogProvider;
use crate::trace::{CallTrace, TraceProvider};

/// Default request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, TraceError> {
        if let Some(error) = self.error {
            return Err(TraceError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: U64,
    block_hash: B256,
    transaction_hash: B256,
    transaction_index: U64,
    log_index: U64,
    #[serde(default)]
    block_timestamp: Option<U64>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    fn into_raw(self, timestamp: u64) -> RawLog {
        RawLog {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number.to(),
            block_hash: self.block_hash,
            tx_hash: self.transaction_hash,
            tx_index: self.transaction_index.to(),
            log_index: self.log_index.to(),
            batch_index: 1,
            timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    timestamp: U64,
}

/// Chain client over HTTP JSON-RPC.
#[derive(Debug)]
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    topics: Vec<B256>,
}

impl JsonRpcClient {
    /// Creates a client for the node at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(url: impl Into<String>) -> Result<Self, TraceError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
            topics: Vec::new(),
        })
    }

    /// Restricts `eth_getLogs` to logs whose signature is in `topics`.
    #[must_use]
    pub fn with_topic_filter(mut self, topics: Vec<B256>) -> Self {
        self.topics = topics;
        self
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, TraceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(method, id, "rpc call");
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&RpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        decode_result(method, response)
    }

    fn log_filter(&self, range: &BlockRange) -> Value {
        let mut filter = json!({
            "fromBlock": format!("{:#x}", range.from_block),
            "toBlock": format!("{:#x}", range.to_block),
        });
        if !self.topics.is_empty() {
            filter["topics"] = json!([self.topics]);
        }
        filter
    }

    async fn block_timestamps(
        &self,
        blocks: BTreeSet<u64>,
    ) -> Result<HashMap<u64, u64>, TraceError> {
        let mut timestamps = HashMap::with_capacity(blocks.len());
        for block in blocks {
            let header: Option<RpcBlockHeader> = self
                .call("eth_getBlockByNumber", json!([format!("{block:#x}"), false]))
                .await?;
            let header = header.ok_or_else(|| {
                TraceError::InvalidResponse(format!("block {block} not found"))
            })?;
            timestamps.insert(block, header.timestamp.to());
        }
        Ok(timestamps)
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, response: RpcResponse) -> Result<T, TraceError> {
    let value = response.into_result()?;
    serde_json::from_value(value)
        .map_err(|e| TraceError::InvalidResponse(format!("{method}: {e}")))
}

/// Drops removed logs and orders the rest by chain position.
fn live_logs(mut logs: Vec<RpcLog>) -> Vec<RpcLog> {
    logs.retain(|log| !log.removed);
    logs.sort_by_key(|log| (log.block_number, log.log_index));
    logs
}

#[async_trait]
impl LogProvider for JsonRpcClient {
    async fn get_logs(&self, range: &BlockRange) -> Result<Vec<RawLog>, TraceError> {
        let logs: Vec<RpcLog> = self.call("eth_getLogs", json!([self.log_filter(range)])).await?;
        let logs = live_logs(logs);

        let missing: BTreeSet<u64> = logs
            .iter()
            .filter(|log| log.block_timestamp.is_none())
            .map(|log| log.block_number.to())
            .collect();
        let timestamps = self.block_timestamps(missing).await?;

        debug!(from = range.from_block, to = range.to_block, logs = logs.len(), "fetched logs");
        Ok(logs
            .into_iter()
            .map(|log| {
                let block: u64 = log.block_number.to();
                let timestamp = log
                    .block_timestamp
                    .map(|t| t.to::<u64>())
                    .or_else(|| timestamps.get(&block).copied())
                    .unwrap_or_default();
                log.into_raw(timestamp)
            })
            .collect())
    }

    async fn block_number(&self) -> Result<u64, TraceError> {
        let head: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(head.to())
    }
}

#[async_trait]
impl TransactionProvider for JsonRpcClient {
    async fn transaction(&self, tx_hash: B256) -> Result<TransactionInfo, TraceError> {
        let tx: Option<RpcTransaction> = self
            .call("eth_getTransactionByHash", json!([tx_hash]))
            .await?;
        let tx = tx.ok_or(TraceError::NotFound(tx_hash))?;
        Ok(TransactionInfo {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
        })
    }
}

#[async_trait]
impl TraceProvider for JsonRpcClient {
    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallTrace, TraceError> {
        let trace: Option<CallTrace> = self
            .call(
                "debug_traceTransaction",
                json!([tx_hash, { "tracer": "callTracer" }]),
            )
            .await?;
        trace.ok_or(TraceError::NotFound(tx_hash))
    }
}
