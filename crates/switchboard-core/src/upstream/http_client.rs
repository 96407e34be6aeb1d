use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{header::RETRY_AFTER, Client, ClientBuilder, StatusCode};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    client::{ConnectionParams, RpcClient},
    events::{EventEmitter, Listener, BLOCK_EVENT, ERROR_EVENT},
    UpstreamError,
};
use crate::types::{parse_block_number, JsonRpcRequest, JsonRpcResponse};

const MAX_ERROR_BODY_LEN: usize = 256;
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// JSON-RPC client over HTTP POST.
///
/// Throttled responses (HTTP 429) are retried on the same endpoint up to the configured
/// throttle limit with a randomized exponential backoff; every other failure is returned
/// to the caller so the router can try another endpoint. New blocks are discovered by
/// polling `eth_blockNumber` while someone listens for `block`.
pub struct HttpRpcClient {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    url: String,
    chain_id: u64,
    client: Client,
    timeout_ms: AtomicU64,
    polling_interval_ms: AtomicU64,
    throttle_limit: u32,
    throttle_slot_interval: Duration,
    next_id: AtomicU64,
    events: EventEmitter,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sanitizes network errors so endpoint credentials embedded in urls never reach logs.
fn sanitize_network_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else if error.is_timeout() {
        "connection timed out".to_string()
    } else if error.is_request() {
        "request failed".to_string()
    } else if error.is_body() {
        "response body error".to_string()
    } else if error.is_decode() {
        "response decode error".to_string()
    } else if error.is_redirect() {
        "too many redirects".to_string()
    } else {
        "network error".to_string()
    }
}

fn truncate_body(raw: String) -> String {
    if raw.len() > MAX_ERROR_BODY_LEN {
        let mut end = MAX_ERROR_BODY_LEN;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &raw[..end])
    } else {
        raw
    }
}

/// Backoff before throttle retry `attempt` (1-based): a random number of slots in
/// `1..=2^attempt`, unless the server asked for a specific delay.
fn throttle_backoff(slot: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(delay) = retry_after {
        return delay;
    }
    let max_slots = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
    let slots = rand::thread_rng().gen_range(1..=max_slots);
    slot.saturating_mul(slots)
}

impl HttpRpcClient {
    /// Creates a client for `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new(url: &str, chain_id: u64, params: &ConnectionParams) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                url: url.to_string(),
                chain_id,
                client,
                timeout_ms: AtomicU64::new(duration_millis(params.timeout)),
                polling_interval_ms: AtomicU64::new(duration_millis(params.polling_interval)),
                throttle_limit: params.throttle_limit,
                throttle_slot_interval: params.throttle_slot_interval,
                next_id: AtomicU64::new(1),
                events: EventEmitter::new(),
                poller: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_poller(&self) {
        let mut poller = self.inner.poller.lock();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(url = %self.inner.url, "no async runtime, block polling disabled");
            return;
        }
        *poller = Some(tokio::spawn(poll_blocks(Arc::downgrade(&self.inner))));
    }

    fn stop_poller(&self) {
        if let Some(handle) = self.inner.poller.lock().take() {
            handle.abort();
        }
    }

    fn sync_poller(&self) {
        if self.inner.events.listener_count(BLOCK_EVENT) > 0 {
            self.ensure_poller();
        } else {
            self.stop_poller();
        }
    }
}

impl HttpInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, Some(params), json!(id));
        let body = bytes::Bytes::from(
            serde_json::to_vec(&request)
                .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?,
        );

        let mut throttled = 0;
        loop {
            let result = self
                .client
                .post(&self.url)
                .header("content-type", "application/json")
                .body(body.clone())
                .timeout(self.timeout())
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout),
                Err(e) => return Err(UpstreamError::ConnectionFailed(sanitize_network_error(&e))),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && throttled < self.throttle_limit {
                throttled += 1;
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let delay = throttle_backoff(self.throttle_slot_interval, throttled, retry_after);
                debug!(
                    url = %self.url,
                    method = method,
                    attempt = throttled,
                    delay_ms = duration_millis(delay),
                    "endpoint throttled request, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                trace!(url = %self.url, status = status.as_u16(), "http request failed");
                return Err(UpstreamError::HttpError(status.as_u16(), truncate_body(text)));
            }

            let bytes = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::ConnectionFailed(sanitize_network_error(&e))
                }
            })?;
            let parsed: JsonRpcResponse = serde_json::from_slice(&bytes)
                .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
            return parsed.into_result();
        }
    }
}

async fn poll_blocks(inner: Weak<HttpInner>) {
    let mut last_seen: Option<u64> = None;

    loop {
        let interval = match inner.upgrade() {
            Some(inner) if !inner.closed.load(Ordering::Acquire) => {
                Duration::from_millis(inner.polling_interval_ms.load(Ordering::Relaxed))
            }
            _ => break,
        };
        tokio::time::sleep(interval).await;

        let Some(inner) = inner.upgrade() else { break };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        match inner.send("eth_blockNumber", json!([])).await {
            Ok(value) => match parse_block_number(&value) {
                Some(number) if last_seen != Some(number) => {
                    last_seen = Some(number);
                    inner.events.emit(BLOCK_EVENT, &json!(number));
                }
                Some(_) => {}
                None => debug!(url = %inner.url, result = %value, "unparseable block number"),
            },
            Err(e) => {
                debug!(url = %inner.url, error = %e, "block poll failed");
                inner.events.emit(ERROR_EVENT, &json!(e.to_string()));
            }
        }
    }

    trace!("block poller exiting");
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    fn url(&self) -> &str {
        &self.inner.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        self.inner.send(method, params).await
    }

    fn get_property(&self, name: &str) -> Result<Value, UpstreamError> {
        match name {
            "url" => Ok(json!(self.inner.url)),
            "chainId" => Ok(json!(self.inner.chain_id)),
            "timeout" => Ok(json!(self.inner.timeout_ms.load(Ordering::Relaxed))),
            "pollingInterval" => Ok(json!(self.inner.polling_interval_ms.load(Ordering::Relaxed))),
            other => Err(UpstreamError::UnsupportedOperation(format!("unknown property {other}"))),
        }
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), UpstreamError> {
        let target = match name {
            "timeout" => &self.inner.timeout_ms,
            "pollingInterval" => &self.inner.polling_interval_ms,
            "url" | "chainId" => {
                return Err(UpstreamError::UnsupportedOperation(format!("{name} is read-only")))
            }
            other => {
                return Err(UpstreamError::UnsupportedOperation(format!("unknown property {other}")))
            }
        };
        let millis = value
            .as_u64()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| UpstreamError::InvalidRequest(format!("{name} must be positive milliseconds")))?;
        target.store(millis, Ordering::Relaxed);
        Ok(())
    }

    fn on(&self, event: &str, listener: Listener) {
        self.inner.events.on(event, listener);
        if event == BLOCK_EVENT {
            self.ensure_poller();
        }
    }

    fn once(&self, event: &str, listener: Listener) {
        self.inner.events.once(event, listener);
        if event == BLOCK_EVENT {
            self.ensure_poller();
        }
    }

    fn off(&self, event: &str, listener: Option<&Listener>) {
        self.inner.events.off(event, listener);
        if event == BLOCK_EVENT {
            self.sync_poller();
        }
    }

    fn emit(&self, event: &str, payload: &Value) -> bool {
        let delivered = self.inner.events.emit(event, payload);
        if event == BLOCK_EVENT {
            // once-listeners may have been the last ones
            self.sync_poller();
        }
        delivered
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_poller();
        self.inner.events.clear();
        debug!(url = %self.inner.url, "http client closed");
    }
}

impl Drop for HttpRpcClient {
    fn drop(&mut self) {
        self.stop_poller();
    }
}
