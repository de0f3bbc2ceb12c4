//! Storage backends for rate limit counters and blocks.
//!
//! The [`Storage`] trait is the only thing the rate limiter talks to. Two
//! implementations exist: [`MemoryStore`], scoped to a single process, and
//! [`RedisStore`], which shares state between every instance pointed at the
//! same Redis server.

mod memory;
mod redis_store;

pub use memory::{MemoryStore, DEFAULT_RECLAIM_INTERVAL};
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BackendKind, StorageConfig};
use crate::deadline::Deadline;

/// Longest expiry any backend will store. Longer counter windows and blocks
/// are clamped to this, so "block forever" settings stay representable.
pub const MAX_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The shared store could not be reached when the backend was created.
    #[error("Failed to connect to shared store: {0}")]
    Connect(String),

    /// A command against the shared store failed.
    #[error("Shared store command failed: {0}")]
    Backend(#[from] redis::RedisError),

    /// The caller's deadline passed before the operation completed.
    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// The store has been closed.
    #[error("Store is closed")]
    Closed,
}

impl StorageError {
    /// Whether this error comes from an expired caller deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StorageError::DeadlineExceeded(_))
    }
}

/// Contract every counter/block backend must satisfy.
///
/// Keys are opaque strings; namespacing them is the caller's job.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend label used in logs.
    fn name(&self) -> &'static str;

    /// Atomically add one to the counter for `key` and return the new value.
    ///
    /// A missing or expired counter restarts at 1 and expires `ttl` from now.
    /// A live counter keeps its original expiry.
    async fn increment(&self, key: &str, ttl: Duration, deadline: Deadline)
        -> Result<u64, StorageError>;

    /// Current live count for `key`, or 0 if absent or expired.
    async fn get(&self, key: &str, deadline: Deadline) -> Result<u64, StorageError>;

    /// Block `key` until `duration` from now, replacing any earlier block.
    async fn set_block(
        &self,
        key: &str,
        duration: Duration,
        deadline: Deadline,
    ) -> Result<(), StorageError>;

    /// Whether `key` has a block that has not yet expired.
    async fn is_blocked(&self, key: &str, deadline: Deadline) -> Result<bool, StorageError>;

    /// Release connections and background tasks. Safe to call more than once.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Build the storage backend described by `config`.
///
/// With [`BackendKind::Auto`] a failed Redis connection is logged and the
/// in-memory store is used instead. The choice is made once; there is no
/// reconnection attempt later.
pub async fn select_backend(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let memory = || -> Arc<dyn Storage> {
        Arc::new(MemoryStore::with_options(
            config.memory.reclaim_interval(),
            config.memory.shards,
        ))
    };

    match config.backend {
        BackendKind::Memory => {
            info!("Using in-memory storage");
            Ok(memory())
        }
        BackendKind::Redis => {
            let store = RedisStore::connect(&config.redis).await?;
            info!(addr = %store.addr(), "Connected to Redis successfully");
            Ok(Arc::new(store))
        }
        BackendKind::Auto => match RedisStore::connect(&config.redis).await {
            Ok(store) => {
                info!(addr = %store.addr(), "Connected to Redis successfully");
                Ok(Arc::new(store))
            }
            Err(e) => {
                warn!(
                    addr = %config.redis.address(),
                    error = %e,
                    "Failed to connect to Redis, falling back to in-memory storage"
                );
                Ok(memory())
            }
        },
    }
}
