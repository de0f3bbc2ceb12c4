//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{Result, TurnstileError};
use crate::storage::Storage;

/// Length of every counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Admission policy for one identity, supplied by the caller on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Requests allowed per window
    pub limit: u64,
    /// How long an identity stays blocked once it exceeds `limit`
    pub block_duration: Duration,
}

impl Policy {
    pub fn new(limit: u64, block_duration: Duration) -> Self {
        Self {
            limit,
            block_duration,
        }
    }
}

/// Decides whether a request may proceed.
///
/// Counting is fixed-window: the first request for a key starts a one second
/// window, and the request that pushes the count past the limit is denied
/// and blocks the key for the policy's block duration. While blocked, requests
/// are denied without touching the counter.
///
/// The limiter holds no state of its own and works the same on any
/// [`Storage`] backend. Storage errors are returned to the caller untouched
/// apart from context; whether to fail open or closed is the caller's call.
pub struct RateLimiter {
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("storage", &self.storage.name())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter on top of a storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Check whether a request for `key` is allowed under `policy`.
    ///
    /// Returns `Ok(false)` both for an identity that is already blocked and
    /// for the request that triggers a new block.
    pub async fn allow_request(&self, key: &str, policy: Policy, deadline: Deadline) -> Result<bool> {
        let blocked = self
            .storage
            .is_blocked(key, deadline)
            .await
            .map_err(|e| TurnstileError::rate_limit("check block status", e))?;

        if blocked {
            trace!(key = %key, "Request denied, key is blocked");
            return Ok(false);
        }

        let count = self
            .storage
            .increment(key, WINDOW, deadline)
            .await
            .map_err(|e| TurnstileError::rate_limit("increment counter", e))?;

        if count > policy.limit {
            self.storage
                .set_block(key, policy.block_duration, deadline)
                .await
                .map_err(|e| TurnstileError::rate_limit("set block", e))?;

            debug!(
                key = %key,
                count = count,
                limit = policy.limit,
                block_duration = ?policy.block_duration,
                "Rate limit exceeded, key blocked"
            );
            return Ok(false);
        }

        trace!(key = %key, count = count, limit = policy.limit, "Request allowed");
        Ok(true)
    }

    /// Whether `key` is currently blocked.
    pub async fn is_blocked(&self, key: &str, deadline: Deadline) -> Result<bool> {
        self.storage
            .is_blocked(key, deadline)
            .await
            .map_err(|e| TurnstileError::rate_limit("check block status", e))
    }

    /// The number of requests counted for `key` in its current window.
    pub async fn get_current_count(&self, key: &str, deadline: Deadline) -> Result<u64> {
        self.storage
            .get(key, deadline)
            .await
            .map_err(|e| TurnstileError::rate_limit("read counter", e))
    }

    /// The backend this limiter runs on.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Close the underlying storage.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await?;
        Ok(())
    }
}
