//! `ChainClient` over Ethereum JSON-RPC.
//!
//! Uses `eth_getBlockByNumber`, `eth_getBlockByHash` and `eth_getLogs`;
//! header lookups for many blocks go out as one batched call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use logpoller_core::client::{ChainClient, LogFilterQuery};
use logpoller_core::error::PollerError;
use logpoller_core::types::{Header, Log};

use crate::request::{JsonRpcRequest, RpcId};
use crate::transport::{HttpTransport, RpcTransport, TransportError};

// ─── Wire formats ────────────────────────────────────────────────────────────

/// The header fields of an `eth_getBlockBy*` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub number: String,
    /// `null` for pending blocks.
    pub hash: Option<B256>,
    pub parent_hash: B256,
    pub timestamp: String,
}

impl RawHeader {
    pub fn into_header(self) -> Result<Header, PollerError> {
        let number = parse_hex_u64(&self.number)?;
        let hash = self.hash.ok_or_else(|| PollerError::InvalidHeader {
            number,
            reason: "pending block has no hash".into(),
        })?;
        Ok(Header {
            number,
            hash,
            parent_hash: self.parent_hash,
            timestamp: parse_hex_u64(&self.timestamp)? as i64,
        })
    }
}

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<String>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<String>,
    /// Set when the log was removed by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn into_log(self, chain_id: u64) -> Result<Log, PollerError> {
        let pending = || PollerError::Rpc("log is still pending".into());
        let block_number = parse_hex_u64(self.block_number.as_deref().ok_or_else(pending)?)?;
        let log_index = parse_hex_u64(self.log_index.as_deref().ok_or_else(pending)?)?;
        Ok(Log {
            chain_id,
            log_index,
            block_hash: self.block_hash.ok_or_else(pending)?,
            block_number,
            block_timestamp: 0,
            address: self.address,
            event_sig: self.topics.first().copied().unwrap_or_default(),
            topics: self.topics,
            data: self.data,
            tx_hash: self.transaction_hash.ok_or_else(pending)?,
        })
    }
}

/// Parse a hex quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, PollerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| PollerError::Rpc(format!("invalid hex quantity {s:?}: {e}")))
}

fn hex_quantity(n: u64) -> String {
    format!("{n:#x}")
}

/// Returns `true` if a JSON-RPC error reports that a log query returned too
/// many results or spanned too many blocks for the provider.
///
/// Providers disagree on codes, so the message is matched too.
pub fn is_result_limit_error(code: i64, message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "query returned more than",
        "response size exceeded",
        "response size is larger",
        "log response size exceeded",
        "limit exceeded",
        "too many results",
        "block range is too wide",
        "block range too large",
        "exceed maximum block range",
        "range too large",
    ];
    let message = message.to_ascii_lowercase();
    code == -32005 || MARKERS.iter().any(|m| message.contains(m))
}

fn map_transport_error(method: &str, e: TransportError) -> PollerError {
    match e {
        TransportError::Rpc(err) if is_result_limit_error(err.code, &err.message) => {
            PollerError::ResultLimitExceeded(err.message)
        }
        other => PollerError::Rpc(format!("{method}: {other}")),
    }
}

// ─── EvmChainClient ──────────────────────────────────────────────────────────

/// A [`ChainClient`] speaking Ethereum JSON-RPC over any [`RpcTransport`].
pub struct EvmChainClient<T> {
    transport: T,
    chain_id: u64,
    next_id: AtomicU64,
}

impl EvmChainClient<HttpTransport> {
    /// Client for the HTTP endpoint at `url`.
    pub fn http(url: impl Into<String>, chain_id: u64, request_timeout: Duration) -> Result<Self, PollerError> {
        let transport = HttpTransport::new(url, request_timeout)
            .map_err(|e| PollerError::Rpc(e.to_string()))?;
        Ok(Self::new(transport, chain_id))
    }
}

impl<T: RpcTransport> EvmChainClient<T> {
    pub fn new(transport: T, chain_id: u64) -> Self {
        Self {
            transport,
            chain_id,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn request(&self, method: &str, params: Vec<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        JsonRpcRequest::new(id, method, params)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, PollerError> {
        let req = self.request(method, params);
        let resp = self
            .transport
            .send(req)
            .await
            .map_err(|e| map_transport_error(method, e))?;
        resp.into_result()
            .map_err(|err| map_transport_error(method, TransportError::Rpc(err)))
    }

    /// Fail unless the node reports the chain id this client was built for.
    pub async fn verify_chain_id(&self) -> Result<(), PollerError> {
        let value = self.call("eth_chainId", vec![]).await?;
        let reported = value
            .as_str()
            .ok_or_else(|| PollerError::Rpc(format!("eth_chainId returned {value}")))
            .and_then(parse_hex_u64)?;
        if reported != self.chain_id {
            return Err(PollerError::Config(format!(
                "node at {} serves chain {reported}, expected {}",
                self.transport.url(),
                self.chain_id
            )));
        }
        Ok(())
    }

    fn decode_header(value: Value) -> Result<Option<Header>, PollerError> {
        if value.is_null() {
            return Ok(None);
        }
        let raw: RawHeader = serde_json::from_value(value)
            .map_err(|e| PollerError::Rpc(format!("malformed block: {e}")))?;
        raw.into_header().map(Some)
    }

    fn log_params(query: &LogFilterQuery) -> Value {
        let mut params = Map::new();
        match query.block_hash {
            Some(hash) => {
                params.insert("blockHash".into(), json!(hash));
            }
            None => {
                if let Some(from) = query.from_block {
                    params.insert("fromBlock".into(), json!(hex_quantity(from)));
                }
                if let Some(to) = query.to_block {
                    params.insert("toBlock".into(), json!(hex_quantity(to)));
                }
            }
        }
        if !query.addresses.is_empty() {
            params.insert("address".into(), json!(query.addresses));
        }
        if !query.topics.is_empty() {
            // An empty position is a wildcard.
            let topics: Vec<Value> = query
                .topics
                .iter()
                .map(|accepted| if accepted.is_empty() { Value::Null } else { json!(accepted) })
                .collect();
            params.insert("topics".into(), Value::Array(topics));
        }
        Value::Object(params)
    }
}

#[async_trait]
impl<T: RpcTransport> ChainClient for EvmChainClient<T> {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, PollerError> {
        let tag = number.map(hex_quantity).unwrap_or_else(|| "latest".into());
        let value = self
            .call("eth_getBlockByNumber", vec![json!(tag), json!(false)])
            .await?;
        Self::decode_header(value)
    }

    async fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, PollerError> {
        let value = self
            .call("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?;
        Self::decode_header(value)
    }

    async fn filter_logs(&self, query: &LogFilterQuery) -> Result<Vec<Log>, PollerError> {
        let value = self.call("eth_getLogs", vec![Self::log_params(query)]).await?;
        let raw: Vec<RawLog> = serde_json::from_value(value)
            .map_err(|e| PollerError::Rpc(format!("malformed logs: {e}")))?;

        let mut logs = Vec::with_capacity(raw.len());
        for log in raw {
            if log.removed {
                continue;
            }
            logs.push(log.into_log(self.chain_id)?);
        }
        debug!(
            from = ?query.from_block,
            to = ?query.to_block,
            hash = ?query.block_hash,
            count = logs.len(),
            "fetched logs"
        );
        Ok(logs)
    }

    async fn batch_headers(&self, numbers: &[u64]) -> Result<Vec<Option<Header>>, PollerError> {
        if numbers.is_empty() {
            return Ok(vec![]);
        }
        let method = "eth_getBlockByNumber";
        let reqs: Vec<JsonRpcRequest> = numbers
            .iter()
            .map(|n| self.request(method, vec![json!(hex_quantity(*n)), json!(false)]))
            .collect();
        let ids: Vec<RpcId> = reqs.iter().map(|r| r.id.clone()).collect();

        let responses = self
            .transport
            .send_batch(reqs)
            .await
            .map_err(|e| map_transport_error(method, e))?;
        let mut by_id: HashMap<RpcId, _> =
            responses.into_iter().map(|r| (r.id.clone(), r)).collect();

        let mut headers = Vec::with_capacity(ids.len());
        for id in ids {
            let resp = by_id
                .remove(&id)
                .ok_or_else(|| map_transport_error(method, TransportError::MissingResponse(id.to_string())))?;
            let value = resp
                .into_result()
                .map_err(|err| map_transport_error(method, TransportError::Rpc(err)))?;
            headers.push(Self::decode_header(value)?);
        }
        Ok(headers)
    }
}
