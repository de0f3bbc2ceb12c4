//! Error types for the Turnstile service.

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A storage failure surfaced while making a rate limit decision
    #[error("Rate limit error: failed to {context}: {source}")]
    RateLimit {
        /// The step of the decision that failed
        context: &'static str,
        #[source]
        source: StorageError,
    },

    /// Storage errors outside of a decision (construction, shutdown)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Wrap a storage error with the decision step it interrupted.
    pub fn rate_limit(context: &'static str, source: StorageError) -> Self {
        TurnstileError::RateLimit { context, source }
    }

    /// Whether the underlying cause is an expired caller deadline.
    ///
    /// A timeout means the decision is unknown, which callers may want to
    /// treat differently from a denial.
    pub fn is_timeout(&self) -> bool {
        match self {
            TurnstileError::RateLimit { source, .. } | TurnstileError::Storage(source) => {
                source.is_timeout()
            }
            _ => false,
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
