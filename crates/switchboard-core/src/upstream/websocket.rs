use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{
    client::{ConnectionParams, RpcClient},
    events::{EventEmitter, Listener, BLOCK_EVENT, CLOSE_EVENT, ERROR_EVENT},
    UpstreamError,
};
use crate::types::{parse_block_number, JsonRpcRequest, JsonRpcResponse};

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Request id reserved for the `newHeads` subscription.
const SUBSCRIPTION_REQUEST_ID: u64 = 0;

type PendingReply = oneshot::Sender<Result<Value, UpstreamError>>;

/// JSON-RPC client over a single WebSocket connection.
///
/// The connection is opened by a background task; requests issued before it is open are
/// queued and flushed once it is. Responses are matched to requests by id. The client
/// subscribes to `newHeads` and emits `block` for every head. When the socket ends, all
/// in-flight requests fail, `error` is emitted if the socket failed, then `close`. A
/// closed client stays closed; the owning endpoint replaces it.
pub struct WsRpcClient {
    inner: Arc<WsInner>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct WsInner {
    url: String,
    chain_id: u64,
    timeout_ms: AtomicU64,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<String>,
    pending: DashMap<u64, PendingReply>,
    events: EventEmitter,
    state: AtomicU8,
}

impl WsRpcClient {
    /// Creates the client and starts connecting to `url` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::ConnectionFailed`] when called outside an async runtime.
    pub fn connect(
        url: &str,
        chain_id: u64,
        params: &ConnectionParams,
    ) -> Result<Self, UpstreamError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            UpstreamError::ConnectionFailed("websocket client requires an async runtime".into())
        })?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let inner = Arc::new(WsInner {
            url: url.to_string(),
            chain_id,
            timeout_ms: AtomicU64::new(u64::try_from(params.timeout.as_millis()).unwrap_or(u64::MAX)),
            next_id: AtomicU64::new(SUBSCRIPTION_REQUEST_ID + 1),
            outgoing,
            pending: DashMap::new(),
            events: EventEmitter::new(),
            state: AtomicU8::new(STATE_CONNECTING),
        });

        let task = runtime.spawn(run_connection(inner.clone(), outgoing_rx, shutdown_rx));

        Ok(Self {
            inner,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns `true` once the socket handshake completed and until it closes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_OPEN
    }
}

async fn run_connection(
    inner: Arc<WsInner>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    info!(url = %inner.url, "connecting to websocket");

    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(inner.url.as_str()) => result,
        _ = &mut shutdown_rx => {
            inner.finish(None);
            return;
        }
    };

    let stream = match connected {
        Ok((stream, response)) => {
            info!(
                url = %inner.url,
                status = response.status().as_u16(),
                "websocket connected successfully"
            );
            stream
        }
        Err(e) => {
            error!(url = %inner.url, error = %e, "websocket connection failed");
            inner.finish(Some(format!("WebSocket connection failed: {e}")));
            return;
        }
    };

    inner.state.store(STATE_OPEN, Ordering::Release);
    let (mut write, mut read) = stream.split();

    let subscribe = json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIPTION_REQUEST_ID,
        "method": "eth_subscribe",
        "params": ["newHeads"]
    });
    if let Err(e) = write.send(Message::Text(subscribe.to_string().into())).await {
        inner.finish(Some(format!("WebSocket send error: {e}")));
        return;
    }

    let failure = loop {
        tokio::select! {
            Some(payload) = outgoing_rx.recv() => {
                if let Err(e) = write.send(Message::Text(payload.into())).await {
                    break Some(format!("WebSocket send error: {e}"));
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => inner.handle_message(&text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(url = %inner.url, "websocket connection closed");
                    break None;
                }
                Some(Err(e)) => {
                    error!(url = %inner.url, error = %e, "websocket error");
                    break Some(format!("WebSocket error: {e}"));
                }
                Some(Ok(_)) => {}
            },
            _ = &mut shutdown_rx => {
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
        }
    };

    inner.finish(failure);
}

impl WsInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    fn handle_message(&self, text: &str) {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            warn!(url = %self.url, "failed to parse websocket message");
            return;
        };

        if message.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            match message.pointer("/params/result/number").and_then(parse_block_number) {
                Some(number) => {
                    self.events.emit(BLOCK_EVENT, &json!(number));
                }
                None => debug!(url = %self.url, "subscription message without block number"),
            }
            return;
        }

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            debug!(url = %self.url, "websocket message without id");
            return;
        };

        if id == SUBSCRIPTION_REQUEST_ID {
            match message.get("error") {
                Some(error) => warn!(url = %self.url, error = %error, "newHeads subscription rejected"),
                None => debug!(url = %self.url, subscription = %message["result"], "subscription confirmed"),
            }
            return;
        }

        let Some((_, reply)) = self.pending.remove(&id) else {
            debug!(url = %self.url, id = id, "response for unknown request");
            return;
        };

        let outcome = serde_json::from_value::<JsonRpcResponse>(message)
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
            .and_then(JsonRpcResponse::into_result);
        let _ = reply.send(outcome);
    }

    fn finish(&self, failure: Option<String>) {
        self.state.store(STATE_CLOSED, Ordering::Release);

        let reason = failure.clone().unwrap_or_else(|| "connection closed".to_string());
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(UpstreamError::ConnectionFailed(reason.clone())));
            }
        }

        if let Some(message) = failure {
            self.events.emit(ERROR_EVENT, &json!(message));
        }
        self.events.emit(CLOSE_EVENT, &json!({ "url": self.url }));
    }
}

#[async_trait]
impl RpcClient for WsRpcClient {
    fn url(&self) -> &str {
        &self.inner.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        if self.inner.is_closed() {
            return Err(UpstreamError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_string(&JsonRpcRequest::new(method, Some(params), json!(id)))
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        let (reply, response) = oneshot::channel();
        self.inner.pending.insert(id, reply);

        // The connection may have finished between the first check and the insert.
        if self.inner.is_closed() || self.inner.outgoing.send(payload).is_err() {
            self.inner.pending.remove(&id);
            return Err(UpstreamError::Closed);
        }

        match tokio::time::timeout(self.inner.timeout(), response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(UpstreamError::Timeout)
            }
        }
    }

    fn get_property(&self, name: &str) -> Result<Value, UpstreamError> {
        match name {
            "url" => Ok(json!(self.inner.url)),
            "chainId" => Ok(json!(self.inner.chain_id)),
            "timeout" => Ok(json!(self.inner.timeout_ms.load(Ordering::Relaxed))),
            other => Err(UpstreamError::UnsupportedOperation(format!(
                "{other} is not available on websocket clients"
            ))),
        }
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), UpstreamError> {
        match name {
            "timeout" => {
                let millis = value.as_u64().filter(|ms| *ms > 0).ok_or_else(|| {
                    UpstreamError::InvalidRequest("timeout must be positive milliseconds".into())
                })?;
                self.inner.timeout_ms.store(millis, Ordering::Relaxed);
                Ok(())
            }
            other => Err(UpstreamError::UnsupportedOperation(format!(
                "{other} cannot be set on websocket clients"
            ))),
        }
    }

    fn on(&self, event: &str, listener: Listener) {
        self.inner.events.on(event, listener);
    }

    fn once(&self, event: &str, listener: Listener) {
        self.inner.events.once(event, listener);
    }

    fn off(&self, event: &str, listener: Option<&Listener>) {
        self.inner.events.off(event, listener);
    }

    fn emit(&self, event: &str, payload: &Value) -> bool {
        self.inner.events.emit(event, payload)
    }

    fn close(&self) {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return;
        };
        let _ = shutdown.send(());
        debug!(url = %self.inner.url, "websocket client closing");
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        // Dropping the shutdown sender ends the connection task on its own; abort covers a
        // task still stuck in the handshake.
        if let Some(task) = self.task.lock().take() {
            if self.shutdown.lock().is_some() {
                task.abort();
            }
        }
    }
}
