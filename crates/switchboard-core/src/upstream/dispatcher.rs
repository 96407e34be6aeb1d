//! Per-network client façade.
//!
//! [`NetworkClient`] looks like a single RPC client but routes every call to one of the
//! network's endpoints and retries on another endpoint when the chosen one fails.
//!
//! # Retry Protocol
//!
//! Each failure lowers the failing endpoint's rating, so the next selection prefers the
//! remaining endpoints. A call gives up once it has failed more than `max_fails_per_call`
//! times and reports every endpoint it tried.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    call_log::CallLog,
    endpoint::Endpoint,
    errors::DispatchError,
    events::Listener,
    rating::RatingStore,
    registry::Network,
    UpstreamError,
};
use crate::types::{parse_block_number, BlockId, Capability, RpcCall, CHAIN_ID_METHOD};

/// Retry and logging behaviour of a [`NetworkClient`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Failed attempts tolerated before a call gives up.
    pub max_fails_per_call: u32,
    /// Log every routing decision at `info` instead of `debug`.
    pub debug: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { max_fails_per_call: 2, debug: false }
    }
}

/// Routing client for one network. Cheap to clone.
#[derive(Clone)]
pub struct NetworkClient {
    network: Arc<Network>,
    ratings: Arc<RatingStore>,
    call_log: Arc<CallLog>,
    options: DispatchOptions,
}

impl NetworkClient {
    #[must_use]
    pub fn new(
        network: Arc<Network>,
        ratings: Arc<RatingStore>,
        call_log: Arc<CallLog>,
        options: DispatchOptions,
    ) -> Self {
        Self { network, ratings, call_log, options }
    }

    #[must_use]
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Returns `true` if any endpoint of the network is tagged with `member`.
    #[must_use]
    pub fn supports(&self, member: &str) -> bool {
        self.network.supports(member)
    }

    /// Replaces every endpoint's client with a fresh connection. Returns the number of
    /// endpoints reconnected.
    pub fn restart(&self) -> usize {
        let reconnected = self.network.reconnect_all();
        info!(network = %self.network.name(), reconnected = reconnected, "network restarted");
        reconnected
    }

    /// Routes one call, retrying on other endpoints while the failure budget lasts.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Upstream`] if the call cannot be encoded or the network has no
    ///   endpoints
    /// - [`DispatchError::ExhaustedRetries`] once more than `max_fails_per_call` attempts
    ///   failed
    pub async fn call(&self, call: RpcCall) -> Result<Value, DispatchError> {
        let call = call.normalized();
        let (method, params) = call.to_request()?;
        let capability = call.capability();

        let mut attempts = 0;
        let mut failed_endpoints = Vec::new();

        loop {
            let endpoint = self.choose(&capability)?;
            self.log_route(&endpoint, call.member(), &method, attempts);

            if call.is_chain_id_query() {
                let response = json!(format!("0x{:x}", self.network.chain_id()));
                self.call_log.record(
                    endpoint.url(),
                    call.member(),
                    call.args(),
                    true,
                    response.clone(),
                );
                return Ok(response);
            }

            match endpoint.client().request(&method, params.clone()).await {
                Ok(response) => {
                    self.call_log.record(
                        endpoint.url(),
                        call.member(),
                        call.args(),
                        false,
                        response.clone(),
                    );
                    return Ok(response);
                }
                Err(e) => {
                    let rating = self.ratings.lower(&endpoint).await;
                    attempts += 1;
                    failed_endpoints.push(endpoint.url().to_string());
                    warn!(
                        network = %self.network.name(),
                        url = %endpoint.url(),
                        method = %method,
                        attempt = attempts,
                        rating = rating,
                        error = %e,
                        "call failed"
                    );

                    if attempts > self.options.max_fails_per_call {
                        return Err(DispatchError::ExhaustedRetries {
                            attempts,
                            endpoints: failed_endpoints,
                            source: e,
                        });
                    }
                }
            }
        }
    }

    /// Reads a client property from one endpoint, retrying like [`NetworkClient::call`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Upstream`] without retrying if the chosen client does not
    /// have the property.
    pub async fn get_property(&self, name: &str) -> Result<Value, DispatchError> {
        let capability = Capability::member(name);
        let mut attempts = 0;
        let mut failed_endpoints = Vec::new();

        loop {
            let endpoint = self.choose(&capability)?;
            match endpoint.client().get_property(name) {
                Ok(value) => {
                    self.call_log.record(endpoint.url(), name, json!([]), false, value.clone());
                    return Ok(value);
                }
                Err(e) if e.is_unsupported_operation() => return Err(e.into()),
                Err(e) => {
                    self.ratings.lower(&endpoint).await;
                    attempts += 1;
                    failed_endpoints.push(endpoint.url().to_string());
                    warn!(
                        network = %self.network.name(),
                        url = %endpoint.url(),
                        property = name,
                        error = %e,
                        "property read failed"
                    );

                    if attempts > self.options.max_fails_per_call {
                        return Err(DispatchError::ExhaustedRetries {
                            attempts,
                            endpoints: failed_endpoints,
                            source: e,
                        });
                    }
                }
            }
        }
    }

    /// Writes a client property on every endpoint that has it. Returns how many did.
    ///
    /// # Errors
    ///
    /// Returns the first error other than an unsupported property.
    pub fn set_property(&self, name: &str, value: &Value) -> Result<usize, DispatchError> {
        let applied = self.network.broadcast_set(name, value)?;
        for endpoint in &applied {
            self.call_log.record(endpoint.url(), name, json!([value]), false, Value::Null);
        }
        debug!(
            network = %self.network.name(),
            property = name,
            applied = applied.len(),
            "property set"
        );
        Ok(applied.len())
    }

    /// Subscribes `listener` to `event` on every endpoint.
    pub fn on(&self, event: &str, listener: Listener) {
        info!(network = %self.network.name(), event = event, "subscribing on all endpoints");
        for endpoint in self.network.endpoints() {
            endpoint.on(event, listener.clone());
            self.record_subscription(endpoint, "on", event);
        }
    }

    /// Subscribes `listener` to the next `event` of every endpoint.
    pub fn once(&self, event: &str, listener: Listener) {
        info!(network = %self.network.name(), event = event, "subscribing once on all endpoints");
        for endpoint in self.network.endpoints() {
            endpoint.once(event, listener.clone());
            self.record_subscription(endpoint, "once", event);
        }
    }

    /// Removes `listener` from `event` on every endpoint, or every listener when `None`.
    pub fn off(&self, event: &str, listener: Option<&Listener>) {
        info!(network = %self.network.name(), event = event, "unsubscribing on all endpoints");
        for endpoint in self.network.endpoints() {
            endpoint.off(event, listener);
            self.record_subscription(endpoint, "off", event);
        }
    }

    fn record_subscription(&self, endpoint: &Endpoint, member: &str, event: &str) {
        self.call_log.record(endpoint.url(), member, json!([event]), false, Value::Null);
    }

    /// Emits `event` on one selected endpoint. Returns whether any listener ran.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Upstream`] if the network has no endpoints.
    pub fn emit(&self, event: &str, payload: &Value) -> Result<bool, DispatchError> {
        let endpoint = self.choose(&Capability::member("emit"))?;
        Ok(endpoint.emit(event, payload))
    }

    /// Sends an arbitrary JSON-RPC request. `params` must be an array or null.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, DispatchError> {
        self.call(RpcCall::send(method, params)).await
    }

    /// Sends an arbitrary JSON-RPC request routed as `member`: endpoints tagged `method`
    /// are preferred, then endpoints tagged `member`.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn send_as(
        &self,
        member: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, DispatchError> {
        self.call(RpcCall::send_as(member, method, params)).await
    }

    /// The network's chain id, answered from configuration.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn chain_id(&self) -> Result<u64, DispatchError> {
        let response = self.send(CHAIN_ID_METHOD, json!([])).await?;
        Self::quantity(&response)
    }

    /// # Errors
    ///
    /// See [`NetworkClient::call`]. A non-numeric response is an
    /// [`UpstreamError::InvalidResponse`].
    pub async fn get_block_number(&self) -> Result<u64, DispatchError> {
        let response = self.call(RpcCall::GetBlockNumber).await?;
        Self::quantity(&response)
    }

    /// Fetches a block header. `BlockId::Number(-1)` means the latest block.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn get_block(&self, block: BlockId) -> Result<Value, DispatchError> {
        self.call(RpcCall::GetBlock(block)).await
    }

    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn get_block_with_transactions(&self, block: BlockId) -> Result<Value, DispatchError> {
        self.call(RpcCall::GetBlockWithTransactions(block)).await
    }

    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn get_logs(&self, filter: Value) -> Result<Value, DispatchError> {
        self.call(RpcCall::GetLogs(filter)).await
    }

    /// Submits a signed, hex-encoded transaction.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn send_raw_transaction(
        &self,
        raw: impl Into<String>,
    ) -> Result<Value, DispatchError> {
        self.call(RpcCall::SendRawTransaction(raw.into())).await
    }

    /// Executes a read-only call against `block`.
    ///
    /// # Errors
    ///
    /// See [`NetworkClient::call`].
    pub async fn eth_call(&self, transaction: Value, block: BlockId) -> Result<Value, DispatchError> {
        self.call(RpcCall::Call { transaction, block }).await
    }

    fn choose(&self, capability: &Capability<'_>) -> Result<Arc<Endpoint>, DispatchError> {
        self.network
            .choose(capability)
            .ok_or(DispatchError::Upstream(UpstreamError::NoEndpoints))
    }

    fn quantity(response: &Value) -> Result<u64, DispatchError> {
        parse_block_number(response).ok_or_else(|| {
            UpstreamError::InvalidResponse(format!("expected a hex quantity, got {response}"))
                .into()
        })
    }

    fn log_route(&self, endpoint: &Endpoint, member: &str, method: &str, attempt: u32) {
        if self.options.debug {
            info!(
                network = %self.network.name(),
                url = %endpoint.url(),
                member = member,
                method = method,
                attempt = attempt,
                rating = endpoint.rating(),
                "routing call"
            );
        } else {
            debug!(
                network = %self.network.name(),
                url = %endpoint.url(),
                member = member,
                method = method,
                attempt = attempt,
                rating = endpoint.rating(),
                "routing call"
            );
        }
    }
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("network", &self.network.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
