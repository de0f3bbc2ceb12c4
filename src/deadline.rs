//! Caller-supplied deadlines for storage and rate limit operations.
//!
//! Every storage operation takes a [`Deadline`]. The core never invents one
//! on its own: the caller decides how long a decision may take, and an
//! expired deadline surfaces as [`StorageError::DeadlineExceeded`] instead of
//! a default answer.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::storage::StorageError;

/// Point in time after which an operation must give up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// A deadline at a fixed instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// The instant this deadline expires, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail fast if the deadline has passed.
    pub fn check(&self, op: &'static str) -> Result<(), StorageError> {
        if self.is_expired() {
            return Err(StorageError::DeadlineExceeded(op));
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the deadline passes first.
    ///
    /// An already expired deadline fails without polling `fut` at all.
    pub async fn run<F, T>(&self, op: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        self.check(op)?;

        match self.at {
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| StorageError::DeadlineExceeded(op))?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_none_never_expires() {
        let deadline = Deadline::none();
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert!(!deadline.is_expired());
        assert!(deadline.check("get").is_ok());
        assert_eq!(deadline.instant(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_expires() {
        let deadline = Deadline::after(Duration::from_millis(10));
        assert!(!deadline.is_expired());

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(deadline.is_expired());

        let err = deadline.check("increment").unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_skips_future_when_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        let mut polled = false;

        let result = deadline
            .run("get", async {
                polled = true;
                Ok::<_, StorageError>(1u64)
            })
            .await;

        assert!(matches!(result, Err(StorageError::DeadlineExceeded("get"))));
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_slow_future() {
        let deadline = Deadline::after(Duration::from_millis(50));

        let result = deadline
            .run("is_blocked", async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, StorageError>(true)
            })
            .await;

        assert!(matches!(
            result,
            Err(StorageError::DeadlineExceeded("is_blocked"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_fixed_instant() {
        let at = Instant::now() + Duration::from_millis(30);
        let deadline = Deadline::at(at);
        assert_eq!(deadline.instant(), Some(at));
        assert!(!deadline.is_expired());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(deadline.is_expired());
        assert!(matches!(
            deadline.check("set_block"),
            Err(StorageError::DeadlineExceeded("set_block"))
        ));
    }

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let value = deadline.run("get", async { Ok(7u64) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
