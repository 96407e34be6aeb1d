//! In-process doubles for clients and stores.
//!
//! Available to this crate's tests and, with the `testing` feature, to integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;

use crate::{
    store::{KvStore, StoreError},
    upstream::{
        client::{ClientConnector, ConnectionParams, RpcClient},
        events::{EventEmitter, Listener},
        UpstreamError,
    },
};

/// Rebuilds an error for replay. Transport errors become `ConnectionFailed`.
fn replay(error: &UpstreamError) -> UpstreamError {
    match error {
        UpstreamError::Timeout => UpstreamError::Timeout,
        UpstreamError::ConnectionFailed(m) => UpstreamError::ConnectionFailed(m.clone()),
        UpstreamError::HttpError(status, body) => UpstreamError::HttpError(*status, body.clone()),
        UpstreamError::RpcError(code, m) => UpstreamError::RpcError(*code, m.clone()),
        UpstreamError::Network(e) => UpstreamError::ConnectionFailed(e.to_string()),
        UpstreamError::InvalidResponse(m) => UpstreamError::InvalidResponse(m.clone()),
        UpstreamError::InvalidRequest(m) => UpstreamError::InvalidRequest(m.clone()),
        UpstreamError::UnsupportedOperation(m) => UpstreamError::UnsupportedOperation(m.clone()),
        UpstreamError::Closed => UpstreamError::Closed,
        UpstreamError::NoEndpoints => UpstreamError::NoEndpoints,
    }
}

fn replay_result(result: &Result<Value, UpstreamError>) -> Result<Value, UpstreamError> {
    match result {
        Ok(value) => Ok(value.clone()),
        Err(e) => Err(replay(e)),
    }
}

struct ScriptedInner {
    url: String,
    queued: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    default_result: Mutex<Result<Value, UpstreamError>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(String, Value)>>,
    events: EventEmitter,
    properties: Mutex<HashMap<String, Value>>,
    unsupported: Mutex<HashSet<String>>,
    fail_property_writes: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

/// Client answering from a script. Clones share state.
#[derive(Clone)]
pub struct ScriptedClient {
    inner: Arc<ScriptedInner>,
}

impl ScriptedClient {
    #[must_use]
    pub fn new(url: &str, chain_id: u64) -> Self {
        let mut properties = HashMap::new();
        properties.insert("url".to_string(), json!(url));
        properties.insert("chainId".to_string(), json!(chain_id));
        properties.insert("timeout".to_string(), json!(10_000));
        properties.insert("pollingInterval".to_string(), json!(4_000));

        Self {
            inner: Arc::new(ScriptedInner {
                url: url.to_string(),
                queued: Mutex::new(VecDeque::new()),
                default_result: Mutex::new(Ok(Value::Null)),
                delay: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                events: EventEmitter::new(),
                properties: Mutex::new(properties),
                unsupported: Mutex::new(HashSet::new()),
                fail_property_writes: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Answers the next request with `result`, ahead of the default.
    pub fn queue_result(&self, result: Result<Value, UpstreamError>) {
        self.inner.queued.lock().push_back(result);
    }

    /// Answers every unqueued request with `result`.
    pub fn set_default_result(&self, result: Result<Value, UpstreamError>) {
        *self.inner.default_result.lock() = result;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.inner.delay.lock() = delay;
    }

    /// Makes the property unreadable and unwritable.
    pub fn mark_unsupported(&self, property: &str) {
        self.inner.unsupported.lock().insert(property.to_string());
    }

    pub fn fail_property_writes(&self, fail: bool) {
        self.inner.fail_property_writes.store(fail, Ordering::SeqCst);
    }

    /// Requests received so far as `(method, params)`.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.inner.requests.lock().clone()
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.events.listener_count(event)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcClient for ScriptedClient {
    fn url(&self) -> &str {
        &self.inner.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        self.inner.requests.lock().push((method.to_string(), params));
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }

        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.inner.queued.lock().pop_front();
        match queued {
            Some(result) => result,
            None => replay_result(&self.inner.default_result.lock()),
        }
    }

    fn get_property(&self, name: &str) -> Result<Value, UpstreamError> {
        if self.inner.unsupported.lock().contains(name) {
            return Err(UpstreamError::UnsupportedOperation(name.to_string()));
        }
        self.inner
            .properties
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| UpstreamError::UnsupportedOperation(name.to_string()))
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), UpstreamError> {
        if self.inner.unsupported.lock().contains(name) {
            return Err(UpstreamError::UnsupportedOperation(name.to_string()));
        }
        if self.inner.fail_property_writes.load(Ordering::SeqCst) {
            return Err(UpstreamError::ConnectionFailed("property write rejected".to_string()));
        }
        self.inner.properties.lock().insert(name.to_string(), value);
        Ok(())
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
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.events.clear();
    }
}

/// Connector handing out [`ScriptedClient`]s and remembering the latest one per url.
#[derive(Default)]
pub struct ScriptedConnector {
    clients: Mutex<HashMap<String, ScriptedClient>>,
    connects: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The client most recently built for `url`.
    #[must_use]
    pub fn client(&self, url: &str) -> Option<ScriptedClient> {
        self.clients.lock().get(url).cloned()
    }

    #[must_use]
    pub fn connect_count(&self, url: &str) -> usize {
        self.connects.lock().get(url).copied().unwrap_or(0)
    }

    /// Makes later connects to `url` fail.
    pub fn fail_connects(&self, url: &str, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(url.to_string());
        } else {
            failing.remove(url);
        }
    }
}

impl ClientConnector for ScriptedConnector {
    fn connect(
        &self,
        url: &str,
        chain_id: u64,
        _params: &ConnectionParams,
    ) -> Result<Box<dyn RpcClient>, UpstreamError> {
        if self.failing.lock().contains(url) {
            return Err(UpstreamError::ConnectionFailed(format!("refused: {url}")));
        }

        let client = ScriptedClient::new(url, chain_id);
        *self.connects.lock().entry(url.to_string()).or_insert(0) += 1;
        self.clients.lock().insert(url.to_string(), client.clone());
        Ok(Box::new(client))
    }
}

/// Store that is never reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl UnavailableStore {
    fn error() -> StoreError {
        StoreError::Unavailable("store offline".to_string())
    }
}

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(Self::error())
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(Self::error())
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(Self::error())
    }

    async fn delete_if_equals(&self, _key: &str, _value: &str) -> Result<bool, StoreError> {
        Err(Self::error())
    }

    async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<i64, StoreError> {
        Err(Self::error())
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(Self::error())
    }

    async fn subscribe_expirations(
        &self,
    ) -> Result<Option<broadcast::Receiver<String>>, StoreError> {
        Err(Self::error())
    }
}
