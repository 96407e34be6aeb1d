//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `SWITCHBOARD_CONFIG` env var
//! 3. **Environment variables**: `SWITCHBOARD__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`RoutingConfig`]: Pick algorithm, retry budget and call log size
//! - [`ConnectionConfig`]: Client timeouts, throttling and reconnects
//! - [`ProbeConfig`]: Active probing schedule and thresholds
//! - [`StoreConfig`]: Shared store backend and penalty expiry
//! - [`LoggingConfig`]: Log level and format
//! - [`NetworkConfig`]: Endpoints of each named network
//!
//! # Validation
//!
//! Configuration is validated before the runtime starts. Invalid configurations (e.g.,
//! no networks, duplicate or malformed urls) return errors rather than failing silently.
//!
//! # Example
//!
//! ```toml
//! [routing]
//! pick_algorithm = "round-robin"
//! max_fails_per_call = 2
//!
//! [networks.mainnet]
//! chain_id = 1
//!
//! [[networks.mainnet.endpoints]]
//! url = "https://eth-mainnet.example.com"
//! tags = ["getLogs"]
//! primary = true
//!
//! [[networks.mainnet.endpoints]]
//! url = "wss://eth-mainnet.example.org"
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Duration,
};

pub use crate::upstream::prober::ProbeConfig;
use crate::upstream::{
    call_log::DEFAULT_CALL_LOG_CAPACITY, client::ConnectionParams, dispatcher::DispatchOptions,
    selector::PickAlgorithm,
};

/// How calls are routed across the endpoints of a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Endpoint pick algorithm. Defaults to `round-robin`.
    pub pick_algorithm: PickAlgorithm,

    /// Failed attempts tolerated per call before giving up. Defaults to `2`.
    pub max_fails_per_call: u32,

    /// Log every routing decision at `info`. Defaults to `false`.
    pub debug: bool,

    /// Number of recent calls kept for diagnostics. Defaults to `50`.
    pub call_log_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            pick_algorithm: PickAlgorithm::RoundRobin,
            max_fails_per_call: 2,
            debug: false,
            call_log_capacity: DEFAULT_CALL_LOG_CAPACITY,
        }
    }
}

/// Settings applied to every endpoint client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Per-request timeout in milliseconds. Defaults to `10000`.
    pub timeout_ms: u64,

    /// Retries of an HTTP 429 response. Defaults to `2`.
    pub throttle_limit: u32,

    /// Base unit of the throttle backoff in milliseconds. Defaults to `10`.
    pub throttle_slot_interval_ms: u64,

    /// Delay before reconnecting a closed socket in milliseconds. Defaults to `1000`.
    pub reconnect_delay_ms: u64,

    /// Block polling period of HTTP clients in milliseconds. Defaults to `4000`.
    pub polling_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            throttle_limit: 2,
            throttle_slot_interval_ms: 10,
            reconnect_delay_ms: 1_000,
            polling_interval_ms: 4_000,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            timeout: Duration::from_millis(self.timeout_ms),
            throttle_limit: self.throttle_limit,
            throttle_slot_interval: Duration::from_millis(self.throttle_slot_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
        }
    }
}

/// Backend holding penalties and probe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Penalties are not shared between processes.
    #[default]
    Memory,
    /// Redis, shared by every process. Requires the `redis` feature.
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Connection url, required for the `redis` backend.
    pub url: Option<String>,

    /// How long a passive-failure penalty lasts. Defaults to `300`.
    pub low_rating_expiry_seconds: u64,

    /// Period of the recovery sweep. Defaults to `5`.
    pub recovery_poll_interval_seconds: u64,

    /// Period of expired-key purging in the memory store, in milliseconds. Defaults to
    /// `1000`.
    pub reap_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            low_rating_expiry_seconds: 300,
            recovery_poll_interval_seconds: 5,
            reap_interval_ms: 1_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn low_rating_expiry(&self) -> Duration {
        Duration::from_secs(self.low_rating_expiry_seconds)
    }

    #[must_use]
    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_poll_interval_seconds)
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// One endpoint of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `http(s)://` or `ws(s)://` url. Must be unique within the network.
    pub url: String,

    /// Operation or remote method names this endpoint should preferably serve.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Preferred by the `primary` pick algorithm.
    #[serde(default)]
    pub primary: bool,
}

/// A named network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub endpoints: Vec<EndpointConfig>,
}

/// Root application configuration containing all subsystem settings.
///
/// Loaded with the `SWITCHBOARD` prefix for environment overrides using `__` as a
/// separator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Networks by name.
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `SWITCHBOARD__` prefix can override any configuration
    /// value. Use `__` as a separator for nested fields (e.g.,
    /// `SWITCHBOARD__ROUTING__DEBUG=true`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("routing.pick_algorithm", "round-robin")?
            .set_default("routing.max_fails_per_call", 2)?
            .set_default("routing.debug", false)?
            .set_default("connection.timeout_ms", 10_000)?
            .set_default("connection.throttle_limit", 2)?
            .set_default("store.backend", "memory")?
            .set_default("store.low_rating_expiry_seconds", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("SWITCHBOARD").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `SWITCHBOARD_CONFIG` environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SWITCHBOARD_CONFIG")
            .unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    #[must_use]
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_fails_per_call: self.routing.max_fails_per_call,
            debug: self.routing.debug,
        }
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// Checks include:
    /// - At least one network, each with a non-empty name free of `:`
    /// - At least one endpoint per network, with unique `http(s)`/`ws(s)` urls
    /// - Positive probe interval and timeout, and thresholds of at least one
    /// - A url for the `redis` store backend
    /// - Logging format is either `"json"` or `"pretty"`
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.networks.is_empty() {
            return Err("No networks configured".to_string());
        }

        for (name, network) in &self.networks {
            if name.is_empty() {
                return Err("Network name cannot be empty".to_string());
            }
            if name.contains(':') {
                return Err(format!("Network name cannot contain ':': {name}"));
            }
            if network.endpoints.is_empty() {
                return Err(format!("No endpoints configured for network: {name}"));
            }

            let mut seen = HashSet::new();
            for endpoint in &network.endpoints {
                let url = endpoint.url.as_str();
                if !["http://", "https://", "ws://", "wss://"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme))
                {
                    return Err(format!("Invalid endpoint URL for network {name}: {url}"));
                }
                if !seen.insert(url) {
                    return Err(format!("Duplicate endpoint URL for network {name}: {url}"));
                }
            }
        }

        if self.probe.interval_ms == 0 {
            return Err("Probe interval must be greater than 0".to_string());
        }

        if self.probe.timeout_ms == 0 {
            return Err("Probe timeout must be greater than 0".to_string());
        }

        if self.probe.max_fails == 0 || self.probe.min_successes == 0 {
            return Err("Probe max_fails and min_successes must be at least 1".to_string());
        }

        if self.connection.timeout_ms == 0 {
            return Err("Connection timeout must be greater than 0".to_string());
        }

        if self.store.recovery_poll_interval_seconds == 0 {
            return Err("Recovery poll interval must be greater than 0".to_string());
        }

        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err("Redis store backend requires store.url".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
