//! Active probing of degraded endpoints.
//!
//! Each endpoint has one prober. A probe only runs when the endpoint is penalized or has
//! stopped reporting blocks. Fail and success counters live in the shared store so
//! processes agree on them, and a probe lease keeps two processes from probing the same
//! endpoint at the same time. The lease is released once the probe has finished.
//!
//! Hysteresis:
//! - `max_fails` failed probes within the fail window lower the rating once; after that the
//!   prober backs off until the fail counter expires
//! - `min_successes` successful probes while penalized restore the default rating

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use super::{
    endpoint::{Endpoint, DEFAULT_RATING},
    rating::RatingStore,
};
use crate::{
    store::{KeyKind, KvStore, StoreKey},
    types::parse_block_number,
};

/// Probe schedule and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_fails: u32,
    pub min_successes: u32,
    pub max_inter_block_interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 5_000,
            max_fails: 2,
            min_successes: 3,
            max_inter_block_interval_ms: 30_000,
        }
    }
}

impl ProbeConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn max_inter_block_interval(&self) -> Duration {
        Duration::from_millis(self.max_inter_block_interval_ms)
    }

    fn success_ttl(&self) -> Duration {
        self.interval() * (self.min_successes + 1)
    }

    fn fail_ttl(&self, fails_before: i64) -> Duration {
        let factor = u32::try_from(fails_before.max(0) + 1).unwrap_or(u32::MAX);
        self.interval().saturating_mul(factor).saturating_mul(3)
    }
}

/// What a single probe tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Full rating and recent blocks, nothing to do.
    Healthy,
    /// A probe of this endpoint is still running.
    InFlight,
    /// The fail counter is at the threshold.
    BackingOff,
    /// Another process holds the probe lease.
    LockedElsewhere,
    /// The probe succeeded; more successes are needed to restore the rating.
    Succeeded,
    /// The probe succeeded and the rating was restored.
    Recovered,
    /// The probe failed below the fail threshold.
    Failed,
    /// The probe failed and the rating was lowered.
    Demoted,
}

/// Clears the in-flight flag when dropped, including on cancellation.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct LocalCounter {
    value: i64,
    expires_at: Instant,
}

/// Periodic health probe for one endpoint.
pub struct Prober {
    endpoint: Arc<Endpoint>,
    ratings: Arc<RatingStore>,
    store: Arc<dyn KvStore>,
    config: ProbeConfig,
    in_flight: AtomicBool,
    owner: String,
    local_counters: Mutex<HashMap<KeyKind, LocalCounter>>,
}

impl Prober {
    #[must_use]
    pub fn new(
        endpoint: Arc<Endpoint>,
        ratings: Arc<RatingStore>,
        store: Arc<dyn KvStore>,
        config: ProbeConfig,
    ) -> Self {
        let owner = format!("{:016x}", rand::thread_rng().gen::<u64>());
        Self {
            endpoint,
            ratings,
            store,
            config,
            in_flight: AtomicBool::new(false),
            owner,
            local_counters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    fn is_healthy(&self) -> bool {
        self.endpoint.rating() >= DEFAULT_RATING &&
            self.endpoint.since_last_block() < self.config.max_inter_block_interval()
    }

    /// Runs one probe cycle.
    pub async fn tick(&self) -> ProbeOutcome {
        if self.is_healthy() {
            return ProbeOutcome::Healthy;
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(url = %self.endpoint.url(), "probe already in flight");
            return ProbeOutcome::InFlight;
        };

        let fails = self.read_counter(KeyKind::Fail).await;
        if fails >= i64::from(self.config.max_fails) {
            debug!(url = %self.endpoint.url(), fails = fails, "fail threshold reached, backing off");
            return ProbeOutcome::BackingOff;
        }

        if !self.acquire_lease().await {
            return ProbeOutcome::LockedElsewhere;
        }

        let client = self.endpoint.client();
        let probe = client.request("eth_getBlockByNumber", json!(["latest", false]));
        let result = tokio::time::timeout(self.config.timeout(), probe).await;
        self.release_lease().await;

        match result {
            Ok(Ok(block)) => self.on_success(&block).await,
            Ok(Err(e)) => {
                debug!(url = %self.endpoint.url(), error = %e, "probe failed");
                self.on_failure(fails).await
            }
            Err(_) => {
                debug!(url = %self.endpoint.url(), "probe timed out");
                self.on_failure(fails).await
            }
        }
    }

    async fn on_success(&self, block: &serde_json::Value) -> ProbeOutcome {
        match block.get("number").and_then(parse_block_number) {
            Some(number) => self.endpoint.observe_block(number),
            None => self.endpoint.record_block(),
        }

        if self.endpoint.rating() >= DEFAULT_RATING {
            return ProbeOutcome::Succeeded;
        }

        let successes = self.increment(KeyKind::Success, self.config.success_ttl()).await;
        if successes < i64::from(self.config.min_successes) {
            debug!(url = %self.endpoint.url(), successes = successes, "probe succeeded");
            return ProbeOutcome::Succeeded;
        }

        self.ratings.reset(&self.endpoint).await;
        self.clear_counters().await;
        info!(
            network = %self.endpoint.network(),
            url = %self.endpoint.url(),
            "endpoint recovered after successful probes"
        );
        ProbeOutcome::Recovered
    }

    async fn on_failure(&self, fails_before: i64) -> ProbeOutcome {
        let fails = self.increment(KeyKind::Fail, self.config.fail_ttl(fails_before)).await;
        if fails < i64::from(self.config.max_fails) {
            return ProbeOutcome::Failed;
        }

        let rating = self.ratings.lower(&self.endpoint).await;
        warn!(
            network = %self.endpoint.network(),
            url = %self.endpoint.url(),
            fails = fails,
            rating = rating,
            "endpoint demoted after failed probes"
        );
        ProbeOutcome::Demoted
    }

    fn key(&self, kind: KeyKind) -> String {
        StoreKey::new(kind, self.endpoint.network(), self.endpoint.url()).to_string()
    }

    /// Takes the probe lease. A lease this prober still holds from an unreleased probe
    /// counts as taken.
    async fn acquire_lease(&self) -> bool {
        let key = self.key(KeyKind::Probe);
        match self.store.set_if_absent(&key, &self.owner, self.config.interval()).await {
            Ok(true) => true,
            Ok(false) => {
                let held = self.store.get(&key).await.ok().flatten();
                if held.as_deref() == Some(self.owner.as_str()) {
                    return true;
                }
                debug!(url = %self.endpoint.url(), "probe lease held by another process");
                false
            }
            Err(e) => {
                warn!(url = %self.endpoint.url(), error = %e, "probe lease unavailable, probing locally");
                true
            }
        }
    }

    async fn release_lease(&self) {
        let key = self.key(KeyKind::Probe);
        if let Err(e) = self.store.delete_if_equals(&key, &self.owner).await {
            debug!(url = %self.endpoint.url(), error = %e, "probe lease not released");
        }
    }

    async fn read_counter(&self, kind: KeyKind) -> i64 {
        let key = self.key(kind);
        match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "counter read failed, using local counter");
                self.local_read(kind)
            }
        }
    }

    async fn increment(&self, kind: KeyKind, ttl: Duration) -> i64 {
        let key = self.key(kind);
        match self.store.incr_with_expiry(&key, ttl).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "counter increment failed, using local counter");
                self.local_increment(kind, ttl)
            }
        }
    }

    async fn clear_counters(&self) {
        self.local_counters.lock().clear();
        for kind in [KeyKind::Fail, KeyKind::Success] {
            let key = self.key(kind);
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "failed to clear probe counter");
            }
        }
    }

    fn local_read(&self, kind: KeyKind) -> i64 {
        let now = Instant::now();
        self.local_counters
            .lock()
            .get(&kind)
            .filter(|counter| counter.expires_at > now)
            .map_or(0, |counter| counter.value)
    }

    fn local_increment(&self, kind: KeyKind, ttl: Duration) -> i64 {
        let now = Instant::now();
        let mut counters = self.local_counters.lock();
        let counter =
            counters.entry(kind).or_insert(LocalCounter { value: 0, expires_at: now + ttl });
        if counter.expires_at <= now {
            counter.value = 0;
        }
        counter.value += 1;
        counter.expires_at = now + ttl;
        counter.value
    }

    /// Starts probing every interval until shutdown. The first probe runs one interval
    /// after start.
    pub fn start_with_shutdown(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let outcome = self.tick().await;
                        if outcome != ProbeOutcome::Healthy {
                            debug!(
                                network = %self.endpoint.network(),
                                url = %self.endpoint.url(),
                                outcome = ?outcome,
                                "probe tick"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(url = %self.endpoint.url(), "prober shutting down");
                        break;
                    }
                }
            }
        })
    }
}
