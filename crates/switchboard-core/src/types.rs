//! Core type definitions for JSON-RPC and the typed call surface.
//!
//! # Type Categories
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: wire envelope
//!
//! ## Routing Types
//! - [`RpcCall`]: the finite set of operations a network client forwards to an endpoint
//! - [`BlockId`]: block selector accepted by block-scoped calls
//! - [`Capability`]: what a call needs from an endpoint, matched against endpoint tags

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{borrow::Cow, fmt, sync::Arc};

use crate::upstream::UpstreamError;

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Remote method answered locally from the network's configured chain id.
pub const CHAIN_ID_METHOD: &str = "eth_chainId";

/// JSON-RPC 2.0 request structure.
///
/// # Example
///
/// ```
/// use switchboard_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_blockNumber", Some(json!([])), json!(1));
///
/// assert_eq!(request.method, "eth_blockNumber");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: Arc<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }
}

/// JSON-RPC 2.0 response structure.
///
/// A response carries either a `result` or an `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Arc<Value>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(result: Value, id: Arc<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(code: i32, message: String, id: Arc<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message, data: None }),
            id,
        }
    }

    /// Converts the envelope into the call outcome.
    ///
    /// A missing `result` without an `error` is treated as `null`, which is what endpoints
    /// return for unknown blocks and transactions.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RpcError`] when the endpoint answered with an error object.
    pub fn into_result(self) -> Result<Value, UpstreamError> {
        match self.error {
            Some(error) => Err(UpstreamError::RpcError(error.code, error.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Block selector for block-scoped calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Latest,
    Pending,
    Earliest,
    Safe,
    Finalized,
    /// Block height. `-1` is accepted as an alias for [`BlockId::Latest`].
    Number(i64),
    Hash(String),
}

impl BlockId {
    /// Replaces the `-1` sentinel with [`BlockId::Latest`].
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Number(-1) => Self::Latest,
            other => other,
        }
    }

    /// Encodes the selector as a JSON-RPC block parameter.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] for negative heights other than `-1`.
    pub fn to_param(&self) -> Result<Value, UpstreamError> {
        match self {
            Self::Number(-1) => Ok(json!("latest")),
            Self::Number(n) if *n < 0 => {
                Err(UpstreamError::InvalidRequest(format!("negative block number {n}")))
            }
            Self::Number(n) => Ok(json!(format!("0x{n:x}"))),
            Self::Hash(hash) => Ok(json!(hash)),
            tag => Ok(json!(tag.to_string())),
        }
    }

    fn as_json(&self) -> Value {
        match self {
            Self::Number(n) => json!(n),
            other => json!(other.to_string()),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Pending => f.write_str("pending"),
            Self::Earliest => f.write_str("earliest"),
            Self::Safe => f.write_str("safe"),
            Self::Finalized => f.write_str("finalized"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Hash(hash) => f.write_str(hash),
        }
    }
}

impl From<u64> for BlockId {
    fn from(number: u64) -> Self {
        Self::Number(i64::try_from(number).unwrap_or(i64::MAX))
    }
}

/// Reads a block number from a JSON-RPC quantity (`"0x1b4"`) or a plain JSON number.
#[must_use]
pub fn parse_block_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
            u64::from_str_radix(digits, 16).ok()
        }
        _ => None,
    }
}

/// What a call needs from an endpoint.
///
/// `member` is the client operation (`getLogs`, `send`, a property name); `method` is the
/// remote JSON-RPC method the call ends up as. Both are matched against endpoint tags,
/// the method first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability<'a> {
    pub member: &'a str,
    pub method: Option<&'a str>,
}

impl<'a> Capability<'a> {
    #[must_use]
    pub fn member(member: &'a str) -> Self {
        Self { member, method: None }
    }

    #[must_use]
    pub fn with_method(mut self, method: &'a str) -> Self {
        self.method = Some(method);
        self
    }
}

/// An operation forwarded to one endpoint of a network.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    /// Generic JSON-RPC request. `member` overrides the `send` member name used for tag
    /// routing and the call log.
    Send { member: Option<String>, method: String, params: Value },
    GetBlockNumber,
    GetBlock(BlockId),
    GetBlockWithTransactions(BlockId),
    /// `eth_getLogs` with the given filter object.
    GetLogs(Value),
    /// `eth_sendRawTransaction` with a signed, hex-encoded transaction.
    SendRawTransaction(String),
    /// `eth_call` against the given block.
    Call { transaction: Value, block: BlockId },
}

impl RpcCall {
    #[must_use]
    pub fn send(method: impl Into<String>, params: Value) -> Self {
        Self::Send { member: None, method: method.into(), params }
    }

    /// A generic request routed and logged as `member`, e.g. `send_as("call", "sendTx", ..)`
    /// prefers endpoints tagged `sendTx`, then endpoints tagged `call`.
    #[must_use]
    pub fn send_as(member: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Send { member: Some(member.into()), method: method.into(), params }
    }

    /// Client member name, as used in endpoint tags and the call log.
    #[must_use]
    pub fn member(&self) -> &str {
        match self {
            Self::Send { member, .. } => member.as_deref().unwrap_or("send"),
            Self::GetBlockNumber => "getBlockNumber",
            Self::GetBlock(_) => "getBlock",
            Self::GetBlockWithTransactions(_) => "getBlockWithTransactions",
            Self::GetLogs(_) => "getLogs",
            Self::SendRawTransaction(_) => "sendTransaction",
            Self::Call { .. } => "call",
        }
    }

    /// Remote JSON-RPC method the call is sent as.
    #[must_use]
    pub fn remote_method(&self) -> &str {
        match self {
            Self::Send { method, .. } => method.as_str(),
            Self::GetBlockNumber => "eth_blockNumber",
            Self::GetBlock(BlockId::Hash(_)) | Self::GetBlockWithTransactions(BlockId::Hash(_)) => {
                "eth_getBlockByHash"
            }
            Self::GetBlock(_) | Self::GetBlockWithTransactions(_) => "eth_getBlockByNumber",
            Self::GetLogs(_) => "eth_getLogs",
            Self::SendRawTransaction(_) => "eth_sendRawTransaction",
            Self::Call { .. } => "eth_call",
        }
    }

    #[must_use]
    pub fn capability(&self) -> Capability<'_> {
        Capability::member(self.member()).with_method(self.remote_method())
    }

    /// Returns `true` for `send("eth_chainId", ..)`, which is answered without a round trip.
    #[must_use]
    pub fn is_chain_id_query(&self) -> bool {
        matches!(self, Self::Send { method, .. } if method == CHAIN_ID_METHOD)
    }

    /// Rewrites block fetches for height `-1` to fetch the latest block.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::GetBlock(block) => Self::GetBlock(block.normalized()),
            Self::GetBlockWithTransactions(block) => {
                Self::GetBlockWithTransactions(block.normalized())
            }
            other => other,
        }
    }

    /// Arguments as the caller passed them, for the call log.
    #[must_use]
    pub fn args(&self) -> Value {
        match self {
            Self::Send { method, params, .. } => json!([method, params]),
            Self::GetBlockNumber => json!([]),
            Self::GetBlock(block) | Self::GetBlockWithTransactions(block) => {
                json!([block.as_json()])
            }
            Self::GetLogs(filter) => json!([filter]),
            Self::SendRawTransaction(raw) => json!([raw]),
            Self::Call { transaction, block } => json!([transaction, block.as_json()]),
        }
    }

    /// Encodes the call as a JSON-RPC method and positional params.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] if the params are not a JSON array or a
    /// block height is negative.
    pub fn to_request(&self) -> Result<(String, Value), UpstreamError> {
        let request = match self {
            Self::Send { method, params, .. } => {
                let params = match params {
                    Value::Null => json!([]),
                    Value::Array(_) => params.clone(),
                    _ => {
                        return Err(UpstreamError::InvalidRequest(format!(
                            "params for {method} must be an array"
                        )))
                    }
                };
                (method.clone(), params)
            }
            Self::GetBlockNumber => (self.remote_method().to_string(), json!([])),
            Self::GetBlock(block) => Self::block_request(block, false)?,
            Self::GetBlockWithTransactions(block) => Self::block_request(block, true)?,
            Self::GetLogs(filter) => (self.remote_method().to_string(), json!([filter])),
            Self::SendRawTransaction(raw) => (self.remote_method().to_string(), json!([raw])),
            Self::Call { transaction, block } => {
                (self.remote_method().to_string(), json!([transaction, block.to_param()?]))
            }
        };
        Ok(request)
    }

    fn block_request(block: &BlockId, full: bool) -> Result<(String, Value), UpstreamError> {
        let method = match block {
            BlockId::Hash(_) => "eth_getBlockByHash",
            _ => "eth_getBlockByNumber",
        };
        Ok((method.to_string(), json!([block.to_param()?, full])))
    }
}
