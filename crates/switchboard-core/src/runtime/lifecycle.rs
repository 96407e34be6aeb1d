//! Runtime lifecycle management including background tasks and graceful shutdown.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::AppConfig,
    store::KvStore,
    upstream::{CallLog, ConfigurationError, EndpointRegistry, NetworkClient, RatingStore},
};

use super::builder::SwitchboardRuntimeBuilder;

/// Owns the endpoint registry, the shared store, the call log and every background task.
///
/// Background tasks (probers, rating recovery, store reaping) listen on one broadcast
/// channel. [`SwitchboardRuntime::shutdown`] signals them, waits for them and closes every
/// endpoint client.
pub struct SwitchboardRuntime {
    registry: Arc<EndpointRegistry>,
    ratings: Arc<RatingStore>,
    store: Arc<dyn KvStore>,
    call_log: Arc<CallLog>,
    shutdown_tx: broadcast::Sender<()>,
    config: AppConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_initiated: AtomicBool,
}

impl SwitchboardRuntime {
    /// Creates a new builder for constructing a `SwitchboardRuntime`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let runtime = SwitchboardRuntime::builder()
    ///     .with_config(config)
    ///     .build()
    ///     .await?;
    /// ```
    #[must_use]
    pub fn builder() -> SwitchboardRuntimeBuilder {
        SwitchboardRuntimeBuilder::new()
    }

    pub(super) fn new(
        registry: Arc<EndpointRegistry>,
        ratings: Arc<RatingStore>,
        store: Arc<dyn KvStore>,
        call_log: Arc<CallLog>,
        shutdown_tx: broadcast::Sender<()>,
        config: AppConfig,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            registry,
            ratings,
            store,
            call_log,
            shutdown_tx,
            config,
            tasks: Mutex::new(tasks),
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    /// Returns the routing client of a configured network.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::UnknownNetwork`] for unknown names and
    /// [`ConfigurationError::NotInitialized`] if no network is configured.
    pub fn network(&self, name: &str) -> Result<NetworkClient, ConfigurationError> {
        let network = self.registry.network(name)?;
        Ok(NetworkClient::new(
            network,
            self.ratings.clone(),
            self.call_log.clone(),
            self.config.dispatch_options(),
        ))
    }

    /// Recent successful calls across every network.
    #[must_use]
    pub fn call_log(&self) -> &Arc<CallLog> {
        &self.call_log
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn ratings(&self) -> &Arc<RatingStore> {
        &self.ratings
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Returns a reference to the application configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Creates a new shutdown receiver for external shutdown coordination.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stops every background task and closes every endpoint client.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("Initiating Switchboard runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!(error = %e, "Failed to send shutdown signal (no receivers)");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("Background task cancelled"),
                Err(e) => error!(error = %e, "Background task failed"),
            }
        }
        debug!("Background tasks stopped");

        self.registry.close_all();
        info!("Switchboard runtime shutdown complete");
    }

    /// Returns `true` once [`SwitchboardRuntime::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SwitchboardRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchboardRuntime")
            .field("registry", &self.registry)
            .field("call_log", &self.call_log)
            .field("shutdown_initiated", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<SwitchboardRuntime>;
    let _ = assert_sync::<SwitchboardRuntime>;
};
