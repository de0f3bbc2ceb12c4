//! Redis-backed storage shared across instances.
//!
//! ## Data model
//!
//! - Counter: the rate limit key itself, holding an integer, with a
//!   millisecond expiry set when the window starts.
//! - Block: `<block_prefix><key>`, holding `1`, expiring when the block ends.
//!
//! Expiry is left entirely to Redis, so there is no reclamation task here.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use tracing::{debug, info};

use super::{Storage, StorageError, MAX_EXPIRY};
use crate::config::RedisConfig;
use crate::deadline::Deadline;

/// Increments a counter and starts its window in one atomic step.
///
/// The expiry is only set when the counter is new (or somehow lost its TTL),
/// so later increments never stretch a running window.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 or redis.call("PTTL", KEYS[1]) == -1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

fn block_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// Milliseconds for a Redis expiry, between 1 (Redis rejects 0) and
/// [`MAX_EXPIRY`].
fn expiry_millis(duration: Duration) -> u64 {
    // MAX_EXPIRY in milliseconds fits a u64 comfortably.
    duration.min(MAX_EXPIRY).as_millis().max(1) as u64
}

/// Rate limit state stored in Redis.
pub struct RedisStore {
    /// `None` once the store is closed.
    connection: RwLock<Option<ConnectionManager>>,
    increment_script: Script,
    block_prefix: String,
    addr: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.addr)
            .field("block_prefix", &self.block_prefix)
            .field("closed", &self.connection.read().is_none())
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    ///
    /// # Errors
    /// Returns [`StorageError::Connect`] if the server cannot be reached
    /// within the configured connect timeout.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let addr = config.address();
        let timeout = config.connect_timeout();

        debug!(addr = %addr, db = config.db, timeout = ?timeout, "Connecting to Redis");

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                password: config.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        };
        let client = Client::open(info).map_err(|e| StorageError::Connect(e.to_string()))?;

        let establish = async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, redis::RedisError>(connection)
        };

        let connection = match tokio::time::timeout(timeout, establish).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(StorageError::Connect(e.to_string())),
            Err(_) => {
                return Err(StorageError::Connect(format!(
                    "timed out after {:?} connecting to {}",
                    timeout, addr
                )))
            }
        };

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            increment_script: Script::new(INCREMENT_SCRIPT),
            block_prefix: config.block_prefix.clone(),
            addr,
        })
    }

    /// The `host:port` this store talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The Redis key holding the block marker for `key`.
    pub fn block_key(&self, key: &str) -> String {
        block_key(&self.block_prefix, key)
    }

    /// A handle to the shared connection. Cloning is cheap and lets the lock
    /// be released before any await.
    fn connection(&self) -> Result<ConnectionManager, StorageError> {
        self.connection.read().clone().ok_or(StorageError::Closed)
    }
}

#[async_trait]
impl Storage for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Deadline,
    ) -> Result<u64, StorageError> {
        let mut connection = self.connection()?;
        let ttl_ms = expiry_millis(ttl);

        deadline
            .run("increment", async {
                let count: u64 = self
                    .increment_script
                    .key(key)
                    .arg(ttl_ms)
                    .invoke_async(&mut connection)
                    .await?;
                Ok(count)
            })
            .await
    }

    async fn get(&self, key: &str, deadline: Deadline) -> Result<u64, StorageError> {
        let mut connection = self.connection()?;

        deadline
            .run("get", async {
                let count: Option<u64> = connection.get(key).await?;
                Ok(count.unwrap_or(0))
            })
            .await
    }

    async fn set_block(
        &self,
        key: &str,
        duration: Duration,
        deadline: Deadline,
    ) -> Result<(), StorageError> {
        let mut connection = self.connection()?;
        let block_key = self.block_key(key);

        deadline
            .run("set_block", async {
                if duration.is_zero() {
                    // A block that ends now is no block; drop any older one.
                    let _: () = connection.del(&block_key).await?;
                } else {
                    let _: () = connection
                        .pset_ex(&block_key, 1, expiry_millis(duration))
                        .await?;
                }
                Ok(())
            })
            .await
    }

    async fn is_blocked(&self, key: &str, deadline: Deadline) -> Result<bool, StorageError> {
        let mut connection = self.connection()?;
        let block_key = self.block_key(key);

        deadline
            .run("is_blocked", async {
                let exists: bool = connection.exists(&block_key).await?;
                Ok(exists)
            })
            .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let connection = self.connection.write().take();
        if connection.is_some() {
            info!(addr = %self.addr, "Redis store closed");
        }
        Ok(())
    }
}
