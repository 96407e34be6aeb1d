use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

use super::{
    client::{ClientConnector, ConnectionParams},
    endpoint::Endpoint,
    errors::ConfigurationError,
    selector::{self, Candidate, PickAlgorithm},
    UpstreamError,
};
use crate::{config::NetworkConfig, types::Capability};

/// A named chain and its endpoints.
pub struct Network {
    name: Arc<str>,
    chain_id: u64,
    endpoints: Vec<Arc<Endpoint>>,
    last_used: Mutex<Option<String>>,
    latest_block: Arc<AtomicU64>,
    pick_algorithm: PickAlgorithm,
}

impl Network {
    fn connect(
        name: &str,
        config: &NetworkConfig,
        pick_algorithm: PickAlgorithm,
        connector: &Arc<dyn ClientConnector>,
        params: &ConnectionParams,
    ) -> Result<Self, UpstreamError> {
        let name: Arc<str> = Arc::from(name);
        let latest_block = Arc::new(AtomicU64::new(0));

        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Endpoint::connect(
                    name.clone(),
                    config.chain_id,
                    endpoint,
                    connector.clone(),
                    params.clone(),
                    latest_block.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            network = %name,
            chain_id = config.chain_id,
            endpoints = endpoints.len(),
            "network connected"
        );

        Ok(Self {
            name,
            chain_id: config.chain_id,
            endpoints,
            last_used: Mutex::new(None),
            latest_block,
            pick_algorithm,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    #[must_use]
    pub fn endpoint(&self, url: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|endpoint| endpoint.url() == url)
    }

    /// Highest block number reported by any endpoint, 0 before the first report.
    #[must_use]
    pub fn latest_block(&self) -> u64 {
        self.latest_block.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_used(&self) -> Option<String> {
        self.last_used.lock().clone()
    }

    /// Picks an endpoint for `capability` and records it as last used.
    ///
    /// Ratings are read while the last-used lock is held, so concurrent round-robin picks
    /// never observe the same last-used url.
    #[must_use]
    pub fn choose(&self, capability: &Capability<'_>) -> Option<Arc<Endpoint>> {
        let mut last_used = self.last_used.lock();

        let candidates: Vec<Candidate<'_>> = self
            .endpoints
            .iter()
            .map(|endpoint| Candidate {
                url: endpoint.url(),
                tags: endpoint.tags(),
                primary: endpoint.is_primary(),
                rating: endpoint.rating(),
            })
            .collect();

        let index = selector::select(
            &candidates,
            capability,
            self.pick_algorithm,
            last_used.as_deref(),
            &mut rand::thread_rng(),
        )?;

        let endpoint = self.endpoints[index].clone();
        *last_used = Some(endpoint.url().to_string());
        Some(endpoint)
    }

    /// Returns `true` if any endpoint is tagged with `member`.
    #[must_use]
    pub fn supports(&self, member: &str) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.supports(member))
    }

    /// Reads `name` from every endpoint's client, keyed by url.
    #[must_use]
    pub fn broadcast_get(&self, name: &str) -> Vec<(String, Result<Value, UpstreamError>)> {
        self.endpoints
            .iter()
            .map(|endpoint| (endpoint.url().to_string(), endpoint.client().get_property(name)))
            .collect()
    }

    /// Writes `name` on every endpoint's client and returns the endpoints that accepted it.
    ///
    /// # Errors
    ///
    /// Returns the first error other than [`UpstreamError::UnsupportedOperation`].
    /// Endpoints after the failing one are not written.
    pub fn broadcast_set(
        &self,
        name: &str,
        value: &Value,
    ) -> Result<Vec<Arc<Endpoint>>, UpstreamError> {
        let mut applied = Vec::new();
        for endpoint in &self.endpoints {
            match endpoint.client().set_property(name, value.clone()) {
                Ok(()) => applied.push(endpoint.clone()),
                Err(e) if e.is_unsupported_operation() => {
                    debug!(
                        network = %self.name,
                        url = %endpoint.url(),
                        property = name,
                        "property not supported, skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Reconnects every endpoint. Failures are logged and the affected endpoint keeps its
    /// previous client. Returns the number of endpoints reconnected.
    pub fn reconnect_all(&self) -> usize {
        let mut reconnected = 0;
        for endpoint in &self.endpoints {
            match endpoint.reconnect() {
                Ok(()) => reconnected += 1,
                Err(e) => {
                    warn!(network = %self.name, url = %endpoint.url(), error = %e, "reconnect failed");
                }
            }
        }
        reconnected
    }

    pub fn close(&self) {
        for endpoint in &self.endpoints {
            endpoint.close();
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("endpoints", &self.endpoints)
            .field("pick_algorithm", &self.pick_algorithm)
            .finish_non_exhaustive()
    }
}

/// All configured networks, created once at startup.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    networks: HashMap<String, Arc<Network>>,
}

impl EndpointRegistry {
    /// Connects every endpoint of every network.
    ///
    /// # Errors
    ///
    /// Returns the first client construction error. Endpoints connected before it are
    /// closed.
    pub fn connect(
        networks: &HashMap<String, NetworkConfig>,
        pick_algorithm: PickAlgorithm,
        connector: Arc<dyn ClientConnector>,
        params: &ConnectionParams,
    ) -> Result<Self, UpstreamError> {
        let mut registry = Self::default();
        for (name, config) in networks {
            match Network::connect(name, config, pick_algorithm, &connector, params) {
                Ok(network) => {
                    registry.networks.insert(name.clone(), Arc::new(network));
                }
                Err(e) => {
                    registry.close_all();
                    return Err(e);
                }
            }
        }
        Ok(registry)
    }

    /// Looks up a configured network.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::NotInitialized`] if no network is configured and
    /// [`ConfigurationError::UnknownNetwork`] if `name` is not one of them.
    pub fn network(&self, name: &str) -> Result<Arc<Network>, ConfigurationError> {
        if self.networks.is_empty() {
            return Err(ConfigurationError::NotInitialized);
        }
        self.networks
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownNetwork(name.to_string()))
    }

    pub fn networks(&self) -> impl Iterator<Item = &Arc<Network>> {
        self.networks.values()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.networks.values().flat_map(|network| network.endpoints().iter())
    }

    /// Finds an endpoint by network name and url.
    #[must_use]
    pub fn endpoint(&self, network: &str, url: &str) -> Option<Arc<Endpoint>> {
        self.networks.get(network)?.endpoint(url).cloned()
    }

    /// Replaces the client of one endpoint with a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the network or url is unknown, otherwise the
    /// endpoint's reconnect error.
    pub fn reconnect(&self, network: &str, url: &str) -> Result<(), ReconnectError> {
        let endpoint = self.network(network)?.endpoint(url).cloned().ok_or_else(|| {
            ConfigurationError::UnknownEndpoint { network: network.to_string(), url: url.to_string() }
        })?;
        endpoint.reconnect()?;
        Ok(())
    }

    /// Reconnects every endpoint of `network`. Returns the number reconnected.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the network is unknown.
    pub fn reconnect_all(&self, network: &str) -> Result<usize, ConfigurationError> {
        Ok(self.network(network)?.reconnect_all())
    }

    /// Closes every client. Used on shutdown.
    pub fn close_all(&self) {
        for network in self.networks.values() {
            network.close();
        }
    }
}

/// Failure of [`EndpointRegistry::reconnect`].
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}
