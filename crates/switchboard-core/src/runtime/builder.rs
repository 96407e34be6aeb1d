//! Builder pattern for initializing the Switchboard runtime.

use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    config::{AppConfig, StoreBackend},
    store::{KvStore, MemoryStore, StoreError},
    upstream::{
        CallLog, ClientConnector, DefaultConnector, EndpointRegistry, Prober, RatingStore,
        UpstreamError,
    },
};

use super::lifecycle::SwitchboardRuntime;

/// Errors that can occur during runtime initialization.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// The configured store could not be reached
    #[error("Failed to initialize store: {0}")]
    Store(#[from] StoreError),

    /// An endpoint client could not be built
    #[error("Failed to connect endpoints: {0}")]
    Connect(#[from] UpstreamError),
}

/// Configuration options for the runtime builder.
#[derive(Clone)]
struct RuntimeOptions {
    enable_probers: bool,
    enable_recovery: bool,
    shutdown_channel_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { enable_probers: true, enable_recovery: true, shutdown_channel_capacity: 16 }
    }
}

/// Builder for constructing a [`SwitchboardRuntime`].
///
/// # Examples
///
/// ```no_run
/// # use switchboard_core::{config::AppConfig, runtime::SwitchboardRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load()?;
///
/// let runtime = SwitchboardRuntimeBuilder::new().with_config(config).build().await?;
/// # Ok(())
/// # }
/// ```
pub struct SwitchboardRuntimeBuilder {
    config: Option<AppConfig>,
    store: Option<Arc<dyn KvStore>>,
    connector: Option<Arc<dyn ClientConnector>>,
    options: RuntimeOptions,
}

impl SwitchboardRuntimeBuilder {
    /// Creates a new runtime builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self { config: None, store: None, connector: None, options: RuntimeOptions::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `store` instead of the backend named in the configuration.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `connector` to build endpoint clients instead of [`DefaultConnector`].
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn ClientConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Disables the per-endpoint probe tasks.
    #[must_use]
    pub fn disable_probers(mut self) -> Self {
        self.options.enable_probers = false;
        self
    }

    /// Disables the rating recovery task. Penalties then only clear through probes.
    #[must_use]
    pub fn disable_recovery(mut self) -> Self {
        self.options.enable_recovery = false;
        self
    }

    /// Sets custom shutdown channel capacity (default: 16).
    #[must_use]
    pub fn with_shutdown_channel_capacity(mut self, capacity: usize) -> Self {
        self.options.shutdown_channel_capacity = capacity;
        self
    }

    /// Builds the runtime, connecting every endpoint and starting background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if configuration is missing or invalid, the store cannot
    /// be reached, or an endpoint client cannot be built.
    pub async fn build(self) -> Result<SwitchboardRuntime, RuntimeError> {
        let config = self.config.ok_or_else(|| {
            RuntimeError::ConfigValidation("No configuration provided".to_string())
        })?;

        config.validate().map_err(RuntimeError::ConfigValidation)?;

        info!(
            networks_count = config.networks.len(),
            pick_algorithm = ?config.routing.pick_algorithm,
            store_backend = ?config.store.backend,
            probers_enabled = self.options.enable_probers,
            "Initializing Switchboard runtime"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(self.options.shutdown_channel_capacity);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => match config.store.backend {
                StoreBackend::Memory => {
                    let store = Arc::new(MemoryStore::new());
                    tasks.push(
                        store.start_reaper(config.store.reap_interval(), shutdown_tx.subscribe()),
                    );
                    debug!("Memory store initialized");
                    store
                }
                StoreBackend::Redis => Self::redis_store(&config).await?,
            },
        };

        let connector = self.connector.unwrap_or_else(|| Arc::new(DefaultConnector));
        let registry = Arc::new(EndpointRegistry::connect(
            &config.networks,
            config.routing.pick_algorithm,
            connector,
            &config.connection.params(),
        )?);
        info!(endpoints_count = registry.endpoints().count(), "Endpoint registry initialized");

        let ratings = Arc::new(RatingStore::new(store.clone(), config.store.low_rating_expiry()));
        ratings.load_persisted(&registry).await;

        if self.options.enable_probers {
            for endpoint in registry.endpoints() {
                let prober = Arc::new(Prober::new(
                    endpoint.clone(),
                    ratings.clone(),
                    store.clone(),
                    config.probe.clone(),
                ));
                tasks.push(prober.start_with_shutdown(shutdown_tx.subscribe()));
            }
            debug!(probers = registry.endpoints().count(), "Prober tasks started");
        }

        if self.options.enable_recovery {
            tasks.push(ratings.clone().start_with_shutdown(
                registry.clone(),
                config.store.recovery_poll_interval(),
                shutdown_tx.subscribe(),
            ));
            debug!("Rating recovery task started");
        }

        let call_log = Arc::new(CallLog::new(config.routing.call_log_capacity));
        let runtime =
            SwitchboardRuntime::new(registry, ratings, store, call_log, shutdown_tx, config, tasks);

        info!("Switchboard runtime initialization complete");

        Ok(runtime)
    }

    #[cfg(feature = "redis")]
    async fn redis_store(config: &AppConfig) -> Result<Arc<dyn KvStore>, RuntimeError> {
        let url = config.store.url.as_deref().ok_or_else(|| {
            RuntimeError::ConfigValidation("Redis store backend requires store.url".to_string())
        })?;
        let store = crate::store::RedisStore::connect(url).await?;
        debug!("Redis store initialized");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    #[allow(clippy::unused_async)]
    async fn redis_store(_config: &AppConfig) -> Result<Arc<dyn KvStore>, RuntimeError> {
        Err(RuntimeError::ConfigValidation(
            "Redis store backend requires the `redis` feature".to_string(),
        ))
    }
}

impl Default for SwitchboardRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
