//! Contract between the router and the clients that talk to endpoints.
//!
//! A client is owned by exactly one endpoint. It is never shared: reconnecting an endpoint
//! builds a new client and closes the old one.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{
    events::Listener, http_client::HttpRpcClient, websocket::WsRpcClient, UpstreamError,
};

/// Connection parameters applied to every client.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries of a throttled (HTTP 429) request before giving up.
    pub throttle_limit: u32,
    /// Base unit of the randomized throttle backoff.
    pub throttle_slot_interval: Duration,
    /// Delay before reconnecting a client whose transport closed.
    pub reconnect_delay: Duration,
    /// Block polling period for transports without push notifications.
    pub polling_interval: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            throttle_limit: 2,
            throttle_slot_interval: Duration::from_millis(10),
            reconnect_delay: Duration::from_millis(1_000),
            polling_interval: Duration::from_millis(4_000),
        }
    }
}

/// A JSON-RPC client bound to one endpoint url.
///
/// Clients emit [`BLOCK_EVENT`](super::events::BLOCK_EVENT) with the block number when
/// they observe a new block. Socket clients also emit `close` and `error`.
#[async_trait]
pub trait RpcClient: Send + Sync {
    fn url(&self) -> &str;

    /// Sends one JSON-RPC request and returns its `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError>;

    /// Reads a client property such as `timeout` or `pollingInterval`.
    fn get_property(&self, name: &str) -> Result<Value, UpstreamError>;

    /// Writes a client property.
    ///
    /// Returns [`UpstreamError::UnsupportedOperation`] if the property does not exist or
    /// cannot be changed on this kind of client.
    fn set_property(&self, name: &str, value: Value) -> Result<(), UpstreamError>;

    fn on(&self, event: &str, listener: Listener);

    fn once(&self, event: &str, listener: Listener);

    fn off(&self, event: &str, listener: Option<&Listener>);

    fn emit(&self, event: &str, payload: &Value) -> bool;

    /// Releases the transport and stops background tasks. Idempotent.
    fn close(&self);
}

/// Builds clients for endpoint urls.
pub trait ClientConnector: Send + Sync {
    /// Creates a client for `url`. Socket clients connect in the background and queue
    /// requests until the connection is open.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::ConnectionFailed`] if the client cannot be constructed.
    fn connect(
        &self,
        url: &str,
        chain_id: u64,
        params: &ConnectionParams,
    ) -> Result<Box<dyn RpcClient>, UpstreamError>;
}

/// Chooses the transport from the url scheme: `ws://` and `wss://` get a WebSocket
/// client, everything else HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl ClientConnector for DefaultConnector {
    fn connect(
        &self,
        url: &str,
        chain_id: u64,
        params: &ConnectionParams,
    ) -> Result<Box<dyn RpcClient>, UpstreamError> {
        if is_websocket_url(url) {
            Ok(Box::new(WsRpcClient::connect(url, chain_id, params)?))
        } else {
            Ok(Box::new(HttpRpcClient::new(url, chain_id, params)?))
        }
    }
}

#[must_use]
pub fn is_websocket_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}
