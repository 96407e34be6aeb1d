use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use super::{KvStore, StoreError};

const EXPIRATION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self { value: value.into(), expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`KvStore`].
///
/// Expired keys are dropped lazily on read and eagerly by the reaper task started with
/// [`MemoryStore::start_reaper`]; both paths publish the key on the expiration channel.
/// Writes that land on an expired but not yet reaped key replace it silently.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    expirations: broadcast::Sender<String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (expirations, _) = broadcast::channel(EXPIRATION_CHANNEL_CAPACITY);
        Self { entries: DashMap::new(), expirations }
    }

    fn notify_expired(&self, key: String) {
        // No subscribers is fine; nobody is waiting for recoveries.
        let _ = self.expirations.send(key);
    }

    /// Removes every expired key and publishes it. Returns how many keys were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.retain(|key, stored| {
            if stored.is_expired(now) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });

        let purged = expired.len();
        for key in expired {
            self.notify_expired(key);
        }
        purged
    }

    /// Number of keys currently held, including expired keys not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Starts the periodic purge task.
    ///
    /// The task holds only a weak reference, so it also ends once the store is dropped.
    pub fn start_reaper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let store = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(store) = store.upgrade() else {
                            debug!("memory store dropped, reaper exiting");
                            break;
                        };
                        let purged = store.purge_expired();
                        if purged > 0 {
                            trace!(purged = purged, "purged expired keys");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("memory store reaper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
            Some(_) => {}
        }

        if self.entries.remove_if(key, |_, stored| stored.is_expired(now)).is_some() {
            self.notify_expired(key.to_string());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), StoredValue::new(value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, stored| !stored.is_expired(now) && stored.value == value);
        Ok(removed.is_some())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut stored =
            self.entries.entry(key.to_string()).or_insert_with(|| StoredValue::new("0", None));

        let current = if stored.is_expired(now) {
            0
        } else {
            stored.value.parse::<i64>().map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value: stored.value.clone(),
            })?
        };

        let next = current + 1;
        stored.value = next.to_string();
        stored.expires_at = Some(now + ttl);
        Ok(next)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = StoredValue::new(value, Some(now + ttl));

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn subscribe_expirations(
        &self,
    ) -> Result<Option<broadcast::Receiver<String>>, StoreError> {
        Ok(Some(self.expirations.subscribe()))
    }
}
