//! Endpoint ratings and their recovery.
//!
//! A passive failure lowers an endpoint's rating by one and persists a penalty key with a
//! TTL. When the key expires the endpoint is restored to the default rating. Expiry is
//! observed through the store's notifications when it has them and through a polling
//! sweep otherwise; the sweep also covers notifications lost while the store was
//! unreachable.

use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use super::{
    endpoint::{Endpoint, DEFAULT_RATING},
    registry::EndpointRegistry,
};
use crate::store::{KeyKind, KvStore, StoreKey};

/// Lowers, resets and restores endpoint ratings through a [`KvStore`].
pub struct RatingStore {
    store: Arc<dyn KvStore>,
    low_rating_expiry: Duration,
}

impl RatingStore {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, low_rating_expiry: Duration) -> Self {
        Self { store, low_rating_expiry }
    }

    #[must_use]
    pub fn low_rating_expiry(&self) -> Duration {
        self.low_rating_expiry
    }

    /// Decrements the endpoint's rating and persists it with the penalty TTL. Returns the
    /// new rating.
    pub async fn lower(&self, endpoint: &Endpoint) -> i64 {
        let _guard = endpoint.rating_lock().lock().await;
        let rating = endpoint.apply_penalty(self.low_rating_expiry);
        let key = StoreKey::rating(endpoint.network(), endpoint.url()).to_string();

        if let Err(e) =
            self.store.set(&key, &rating.to_string(), Some(self.low_rating_expiry)).await
        {
            warn!(
                network = %endpoint.network(),
                url = %endpoint.url(),
                error = %e,
                "failed to persist rating, keeping it local"
            );
        }

        info!(network = %endpoint.network(), url = %endpoint.url(), rating = rating, "rating lowered");
        rating
    }

    /// Restores the default rating and deletes the penalty key.
    pub async fn reset(&self, endpoint: &Endpoint) {
        let _guard = endpoint.rating_lock().lock().await;
        let previous = endpoint.rating();
        endpoint.restore_rating();

        let key = StoreKey::rating(endpoint.network(), endpoint.url()).to_string();
        if let Err(e) = self.store.delete(&key).await {
            warn!(
                network = %endpoint.network(),
                url = %endpoint.url(),
                error = %e,
                "failed to delete penalty key"
            );
        }

        if previous != DEFAULT_RATING {
            info!(
                network = %endpoint.network(),
                url = %endpoint.url(),
                previous = previous,
                "rating restored"
            );
        }
    }

    /// Adopts ratings persisted by other processes for every endpoint of `registry`.
    pub async fn load_persisted(&self, registry: &EndpointRegistry) {
        for endpoint in registry.endpoints() {
            let key = StoreKey::rating(endpoint.network(), endpoint.url()).to_string();
            let stored = match self.store.get(&key).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(url = %endpoint.url(), error = %e, "failed to load persisted rating");
                    continue;
                }
            };

            match stored.parse::<i64>() {
                Ok(rating) => {
                    let _guard = endpoint.rating_lock().lock().await;
                    endpoint.adopt_rating(rating, self.low_rating_expiry);
                    debug!(
                        network = %endpoint.network(),
                        url = %endpoint.url(),
                        rating = endpoint.rating(),
                        "loaded persisted rating"
                    );
                }
                Err(_) => {
                    warn!(key = %key, value = %stored, "ignoring malformed persisted rating");
                }
            }
        }
    }

    /// Handles one expired key. Returns `true` if an endpoint was restored.
    pub async fn handle_expired_key(&self, registry: &EndpointRegistry, raw: &str) -> bool {
        let Some(key) = StoreKey::decode(raw) else {
            return false;
        };
        if key.kind != KeyKind::Rating {
            return false;
        }
        let Some(endpoint) = registry.endpoint(&key.network, &key.url) else {
            debug!(key = %raw, "expired penalty for unknown endpoint");
            return false;
        };

        // Another process may have penalized the endpoint again in the meantime.
        if let Ok(Some(_)) = self.store.get(raw).await {
            return false;
        }

        self.reset(&endpoint).await;
        true
    }

    /// Restores every penalized endpoint whose local deadline passed and whose penalty key
    /// is gone or unreadable. Returns the number restored.
    pub async fn sweep(&self, registry: &EndpointRegistry) -> usize {
        let mut restored = 0;
        for endpoint in registry.endpoints() {
            if endpoint.rating() >= DEFAULT_RATING || !endpoint.penalty_elapsed() {
                continue;
            }

            let key = StoreKey::rating(endpoint.network(), endpoint.url()).to_string();
            match self.store.get(&key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    debug!(url = %endpoint.url(), error = %e, "store unreachable, restoring locally");
                }
            }

            self.reset(endpoint).await;
            restored += 1;
        }
        restored
    }

    /// Starts the recovery task: expiry notifications when the store delivers them, plus a
    /// sweep every `poll_interval`.
    pub fn start_with_shutdown(
        self: Arc<Self>,
        registry: Arc<EndpointRegistry>,
        poll_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut expirations = match self.store.subscribe_expirations().await {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!(error = %e, "expiry notifications unavailable, polling only");
                    None
                }
            };
            if expirations.is_none() {
                info!(
                    poll_interval_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX),
                    "rating recovery running in polling mode"
                );
            }

            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = recv_expiration(&mut expirations) => match received {
                        Ok(key) => {
                            self.handle_expired_key(&registry, &key).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "missed expiry notifications, sweeping");
                            self.sweep(&registry).await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("expiry notification stream closed, falling back to polling");
                            expirations = None;
                        }
                    },
                    _ = interval.tick() => {
                        let restored = self.sweep(&registry).await;
                        if restored > 0 {
                            debug!(restored = restored, "recovery sweep restored endpoints");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("rating recovery shutting down");
                        break;
                    }
                }
            }
        })
    }
}

async fn recv_expiration(
    receiver: &mut Option<broadcast::Receiver<String>>,
) -> Result<String, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for RatingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatingStore")
            .field("low_rating_expiry", &self.low_rating_expiry)
            .finish_non_exhaustive()
    }
}
