//! Shared key-value store used to synchronize endpoint health across processes.
//!
//! Every process routing for the same networks points at the same store. Penalties,
//! probe counters and probe leases live there under the keys described in [`keys`],
//! so a failure observed by one process is visible to all of them.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used when no shared store is configured and in tests
//! - `RedisStore` (feature `redis`): shared store with keyspace expiry notifications
//!
//! # Failure Model
//!
//! Store errors never reach RPC callers. Callers of [`KvStore`] log them at `warn` and
//! fall back to process-local state.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use keys::{KeyKind, StoreKey};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised by a [`KvStore`] backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a command.
    #[error("Store command failed: {0}")]
    Command(String),

    /// A stored value could not be interpreted.
    #[error("Invalid value for key {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Minimal key-value contract needed for cross-process health state.
///
/// `incr_with_expiry`, `set_if_absent` and `delete_if_equals` must be atomic on the
/// backend: concurrent
/// callers in different processes never observe a lost update.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Removes `key` only if it currently holds `value`. Returns `true` when it was removed.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Increments the integer under `key` (missing counts as zero), refreshes its TTL and
    /// returns the new value, as one atomic operation.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Stores `value` under `key` only if the key is absent. Returns `true` when the value
    /// was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Subscribes to key-expiry notifications.
    ///
    /// Returns `Ok(None)` when the backend cannot deliver them; callers then poll.
    async fn subscribe_expirations(
        &self,
    ) -> Result<Option<broadcast::Receiver<String>>, StoreError>;
}
