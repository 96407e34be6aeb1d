use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::MultiplexedConnection, Client, RedisError, Script};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{KvStore, StoreError};

const EXPIRATION_CHANNEL_CAPACITY: usize = 1024;

// INCR and PEXPIRE run as one script so the counter and its TTL move together.
const INCR_WITH_EXPIRY_SCRIPT: &str = r"
local value = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return value
";

// Only the holder of a lease may release it.
const DELETE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// [`KvStore`] backed by a Redis server shared by every cooperating process.
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    database: i64,
    incr_script: Script,
    delete_if_equals_script: Script,
}

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
            StoreError::Unavailable(error.to_string())
        } else {
            StoreError::Command(error.to_string())
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisStore {
    /// Connects to the Redis server at `url` (`redis://host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the url is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let database = client.get_connection_info().redis.db;
        let connection = client.get_multiplexed_async_connection().await?;

        info!(database = database, "connected to redis store");

        Ok(Self {
            client,
            connection,
            database,
            incr_script: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            delete_if_equals_script: Script::new(DELETE_IF_EQUALS_SCRIPT),
        })
    }

    fn expiration_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.database)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<String> =
            redis::cmd("GET").arg(key).query_async(&mut connection).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = command.query_async(&mut connection).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut connection).await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed: i64 = self
            .delete_if_equals_script
            .key(key)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(removed > 0)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        let value: i64 = self
            .incr_script
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn subscribe_expirations(
        &self,
    ) -> Result<Option<broadcast::Receiver<String>>, StoreError> {
        let mut connection = self.connection.clone();
        let enabled: Result<(), RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut connection)
            .await;
        if let Err(e) = enabled {
            // Managed Redis often forbids CONFIG; notifications may already be enabled.
            warn!(error = %e, "could not enable keyspace expiry notifications");
        }

        let channel = self.expiration_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = broadcast::channel(EXPIRATION_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(key) => {
                        if tx.send(key).is_err() {
                            debug!("no expiration subscribers left");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable expiration payload"),
                }
            }
            debug!(channel = %channel, "redis expiration stream ended");
        });

        Ok(Some(rx))
    }
}
