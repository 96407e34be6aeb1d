use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    client::{ClientConnector, ConnectionParams, RpcClient},
    events::{EventEmitter, Listener, BLOCK_EVENT, CLOSE_EVENT, LATEST_BLOCK_EVENT},
    UpstreamError,
};
use crate::{config::EndpointConfig, types::parse_block_number};

/// Rating of an endpoint nothing has complained about. Ratings never exceed it.
pub const DEFAULT_RATING: i64 = 100;

struct ClientSlot {
    client: Arc<dyn RpcClient>,
    generation: u64,
}

/// One configured url of a network together with its health state and client.
///
/// The endpoint wraps its client: the network-wide `latest-block` event is handled here and
/// survives reconnects, everything else is forwarded to the current client. Listeners
/// registered with [`Endpoint::on`] are replayed onto every replacement client.
pub struct Endpoint {
    network: Arc<str>,
    url: String,
    tags: Vec<String>,
    primary: bool,
    chain_id: u64,
    rating: AtomicI64,
    /// Serializes rating changes with their persistence.
    rating_lock: tokio::sync::Mutex<()>,
    penalized_until: Mutex<Option<Instant>>,
    last_block_at: Mutex<Instant>,
    slot: ArcSwap<ClientSlot>,
    generation: AtomicU64,
    closing: AtomicBool,
    /// Caller listeners replayed on reconnect. Held while touching the client slot so a
    /// listener is registered exactly once per client.
    subscriptions: Mutex<Vec<(String, Listener)>>,
    latest_block_events: EventEmitter,
    network_latest_block: Arc<AtomicU64>,
    connector: Arc<dyn ClientConnector>,
    params: ConnectionParams,
    self_ref: Weak<Endpoint>,
}

impl Endpoint {
    /// Connects a client for `config.url` and wires the endpoint's internal listeners.
    ///
    /// `network_latest_block` is shared by every endpoint of the network and only moves
    /// forward.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the client cannot be built.
    pub fn connect(
        network: Arc<str>,
        chain_id: u64,
        config: &EndpointConfig,
        connector: Arc<dyn ClientConnector>,
        params: ConnectionParams,
        network_latest_block: Arc<AtomicU64>,
    ) -> Result<Arc<Self>, UpstreamError> {
        let client: Arc<dyn RpcClient> =
            Arc::from(connector.connect(&config.url, chain_id, &params)?);

        let endpoint = Arc::new_cyclic(|self_ref| Self {
            network,
            url: config.url.clone(),
            tags: config.tags.clone(),
            primary: config.primary,
            chain_id,
            rating: AtomicI64::new(DEFAULT_RATING),
            rating_lock: tokio::sync::Mutex::new(()),
            penalized_until: Mutex::new(None),
            last_block_at: Mutex::new(Instant::now()),
            slot: ArcSwap::from_pointee(ClientSlot { client: client.clone(), generation: 1 }),
            generation: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            latest_block_events: EventEmitter::new(),
            network_latest_block,
            connector,
            params,
            self_ref: self_ref.clone(),
        });

        endpoint.install_hooks(client.as_ref(), 1);
        debug!(network = %endpoint.network, url = %endpoint.url, "endpoint connected");
        Ok(endpoint)
    }

    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Returns `true` if the endpoint is tagged with `member`.
    #[must_use]
    pub fn supports(&self, member: &str) -> bool {
        self.tags.iter().any(|tag| tag == member)
    }

    /// The client currently owned by this endpoint.
    #[must_use]
    pub fn client(&self) -> Arc<dyn RpcClient> {
        self.slot.load().client.clone()
    }

    /// Number of clients this endpoint has built, including the current one.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.slot.load().generation
    }

    #[must_use]
    pub fn rating(&self) -> i64 {
        self.rating.load(Ordering::Acquire)
    }

    pub(crate) fn rating_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.rating_lock
    }

    /// Decrements the rating and records when the penalty ends locally. Returns the new
    /// rating.
    pub(crate) fn apply_penalty(&self, expiry: Duration) -> i64 {
        *self.penalized_until.lock() = Some(Instant::now() + expiry);
        self.rating.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn restore_rating(&self) {
        self.rating.store(DEFAULT_RATING, Ordering::Release);
        *self.penalized_until.lock() = None;
    }

    /// Adopts a rating persisted by another process. The local penalty deadline is
    /// restarted because the remaining TTL is unknown.
    pub(crate) fn adopt_rating(&self, rating: i64, expiry: Duration) {
        let rating = rating.min(DEFAULT_RATING);
        self.rating.store(rating, Ordering::Release);
        if rating < DEFAULT_RATING {
            *self.penalized_until.lock() = Some(Instant::now() + expiry);
        }
    }

    /// Returns `true` if the local penalty deadline has passed or was never set.
    #[must_use]
    pub fn penalty_elapsed(&self) -> bool {
        self.penalized_until.lock().map_or(true, |until| until <= Instant::now())
    }

    /// Time since this endpoint last reported a block, or since it was connected.
    #[must_use]
    pub fn since_last_block(&self) -> Duration {
        self.last_block_at.lock().elapsed()
    }

    pub fn record_block(&self) {
        *self.last_block_at.lock() = Instant::now();
    }

    /// Records a block reported by the client and emits `latest-block` if it is the
    /// highest block seen on the network so far.
    pub fn observe_block(&self, number: u64) {
        self.record_block();
        let previous = self.network_latest_block.fetch_max(number, Ordering::AcqRel);
        if number > previous {
            debug!(network = %self.network, url = %self.url, block = number, "new latest block");
            self.latest_block_events.emit(LATEST_BLOCK_EVENT, &json!(number));
        }
    }

    pub fn on(&self, event: &str, listener: Listener) {
        if event == LATEST_BLOCK_EVENT {
            self.latest_block_events.on(event, listener);
            return;
        }
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.push((event.to_string(), listener.clone()));
        self.slot.load().client.on(event, listener);
    }

    /// Registers a one-shot listener on the current client. It is not carried over to a
    /// replacement client.
    pub fn once(&self, event: &str, listener: Listener) {
        if event == LATEST_BLOCK_EVENT {
            self.latest_block_events.once(event, listener);
            return;
        }
        self.client().once(event, listener);
    }

    /// Removes `listener`, or every caller listener of `event` when `None`. The
    /// endpoint's own listeners stay registered.
    pub fn off(&self, event: &str, listener: Option<&Listener>) {
        if event == LATEST_BLOCK_EVENT {
            self.latest_block_events.off(event, listener);
            return;
        }

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|(name, registered)| {
            name != event || listener.is_some_and(|target| !Arc::ptr_eq(registered, target))
        });

        let slot = self.slot.load();
        slot.client.off(event, listener);
        if listener.is_none() {
            if let Some(hook) = self.hook(event, slot.generation) {
                slot.client.on(event, hook);
            }
        }
    }

    pub fn emit(&self, event: &str, payload: &Value) -> bool {
        if event == LATEST_BLOCK_EVENT {
            return self.latest_block_events.emit(event, payload);
        }
        self.client().emit(event, payload)
    }

    /// Replaces the client with a fresh connection and closes the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Closed`] after [`Endpoint::close`], or the connector's
    /// error if the new client cannot be built. The previous client stays in place on
    /// error.
    pub fn reconnect(&self) -> Result<(), UpstreamError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed);
        }

        let client: Arc<dyn RpcClient> =
            Arc::from(self.connector.connect(&self.url, self.chain_id, &self.params)?);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        self.install_hooks(client.as_ref(), generation);
        let previous = {
            let subscriptions = self.subscriptions.lock();
            for (event, listener) in subscriptions.iter() {
                client.on(event, listener.clone());
            }
            self.slot.swap(Arc::new(ClientSlot { client, generation }))
        };
        previous.client.close();

        info!(network = %self.network, url = %self.url, generation = generation, "endpoint reconnected");
        Ok(())
    }

    /// Closes the client for good. Later transport closes no longer trigger reconnects.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.load().client.close();
        self.latest_block_events.clear();
        debug!(network = %self.network, url = %self.url, "endpoint closed");
    }

    fn install_hooks(&self, client: &dyn RpcClient, generation: u64) {
        for event in [BLOCK_EVENT, CLOSE_EVENT] {
            if let Some(hook) = self.hook(event, generation) {
                client.on(event, hook);
            }
        }
    }

    fn hook(&self, event: &str, generation: u64) -> Option<Listener> {
        let endpoint = self.self_ref.clone();
        match event {
            BLOCK_EVENT => Some(Arc::new(move |payload: &Value| {
                let Some(endpoint) = endpoint.upgrade() else { return };
                match parse_block_number(payload) {
                    Some(number) => endpoint.observe_block(number),
                    None => endpoint.record_block(),
                }
            })),
            CLOSE_EVENT => Some(Arc::new(move |_: &Value| {
                if let Some(endpoint) = endpoint.upgrade() {
                    endpoint.schedule_reconnect(generation);
                }
            })),
            _ => None,
        }
    }

    fn schedule_reconnect(&self, generation: u64) {
        if self.closing.load(Ordering::Acquire) ||
            self.generation.load(Ordering::Acquire) != generation
        {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(network = %self.network, url = %self.url, "no async runtime, cannot reconnect");
            return;
        };

        let delay = self.params.reconnect_delay;
        warn!(
            network = %self.network,
            url = %self.url,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "endpoint transport closed, scheduling reconnect"
        );

        let endpoint = self.self_ref.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(endpoint) = endpoint.upgrade() else { return };
            if endpoint.closing.load(Ordering::Acquire) ||
                endpoint.generation.load(Ordering::Acquire) != generation
            {
                return;
            }
            if let Err(e) = endpoint.reconnect() {
                warn!(
                    network = %endpoint.network,
                    url = %endpoint.url,
                    error = %e,
                    "endpoint reconnect failed"
                );
            }
        });
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("network", &self.network)
            .field("url", &self.url)
            .field("tags", &self.tags)
            .field("primary", &self.primary)
            .field("rating", &self.rating())
            .finish_non_exhaustive()
    }
}
