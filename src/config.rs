//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, an optional YAML file,
//! `TURNSTILE_*` environment variables (`__` separates nested keys, e.g.
//! `TURNSTILE_STORAGE__REDIS__HOST`), and finally per-token overrides given
//! as `TOKEN_<NAME>=<token>` with optional `TOKEN_<NAME>_LIMIT` and
//! `TOKEN_<NAME>_BLOCK_TIME`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Policy;
use crate::storage::DEFAULT_RECLAIM_INTERVAL;

/// Prefix for environment variables read by [`TurnstileConfig::load`].
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting policies
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Time budget for a single rate limit decision, in milliseconds
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            decision_timeout_ms: default_decision_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_decision_timeout() -> u64 {
    2000
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Try Redis, fall back to memory if it is unreachable
    #[default]
    Auto,
    /// In-process only
    Memory,
    /// Redis only; failing to connect is fatal
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// In-process store settings
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,

    /// Upper bound on establishing the initial connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Prefix separating block markers from counters
    #[serde(default = "default_block_prefix")]
    pub block_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout(),
            block_prefix: default_block_prefix(),
        }
    }
}

impl RedisConfig {
    /// `host:port`, for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_block_prefix() -> String {
    "block:".to_string()
}

/// In-process store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Seconds between sweeps of expired entries
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,

    /// Number of independently locked partitions
    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reclaim_interval_secs: default_reclaim_interval(),
            shards: default_shards(),
        }
    }
}

impl MemoryConfig {
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

fn default_reclaim_interval() -> u64 {
    DEFAULT_RECLAIM_INTERVAL.as_secs()
}

fn default_shards() -> usize {
    1
}

/// A limit and block time as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Requests allowed per second
    pub limit: u64,
    /// Seconds an identity stays blocked after exceeding the limit
    pub block_time_secs: u64,
}

impl PolicyConfig {
    pub fn new(limit: u64, block_time_secs: u64) -> Self {
        Self {
            limit,
            block_time_secs,
        }
    }

    pub fn policy(&self) -> Policy {
        Policy::new(self.limit, Duration::from_secs(self.block_time_secs))
    }
}

/// Rate limiting policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy for requests identified by client address
    #[serde(default = "default_ip_policy")]
    pub ip: PolicyConfig,

    /// Policy for requests carrying a token without an override
    #[serde(default = "default_token_policy")]
    pub token: PolicyConfig,

    /// Per-token overrides, keyed by token value
    #[serde(default)]
    pub tokens: HashMap<String, PolicyConfig>,

    /// Header carrying the credential token
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip: default_ip_policy(),
            token: default_token_policy(),
            tokens: HashMap::new(),
            token_header: default_token_header(),
        }
    }
}

fn default_ip_policy() -> PolicyConfig {
    PolicyConfig::new(10, 300)
}

fn default_token_policy() -> PolicyConfig {
    PolicyConfig::new(100, 300)
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

impl RateLimitingConfig {
    /// Merge `TOKEN_<NAME>` style overrides from `vars`.
    ///
    /// `TOKEN_<NAME>` holds the token value. `TOKEN_<NAME>_LIMIT` and
    /// `TOKEN_<NAME>_BLOCK_TIME` are optional; missing or unparsable values
    /// fall back to the default token policy. Returns how many tokens were
    /// added.
    pub fn apply_token_env<I>(&mut self, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut added = 0;

        for (key, token) in &vars {
            let Some(name) = key.strip_prefix("TOKEN_") else {
                continue;
            };
            if name.is_empty()
                || key.ends_with("_LIMIT")
                || key.ends_with("_BLOCK_TIME")
                || token.is_empty()
            {
                continue;
            }

            let number = |suffix: &str, fallback: u64| {
                vars.get(&format!("TOKEN_{}_{}", name, suffix))
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(fallback)
            };

            let policy = PolicyConfig::new(
                number("LIMIT", self.token.limit),
                number("BLOCK_TIME", self.token.block_time_secs),
            );
            debug!(name = %name, limit = policy.limit, block_time_secs = policy.block_time_secs, "Loaded token override");
            self.tokens.insert(token.clone(), policy);
            added += 1;
        }

        added
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file, the environment and
    /// `TOKEN_*` overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.rate_limiting.apply_token_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.ip.limit == 0 {
            return Err(TurnstileError::Config("rate_limiting.ip.limit must be > 0".into()));
        }
        if rl.token.limit == 0 {
            return Err(TurnstileError::Config("rate_limiting.token.limit must be > 0".into()));
        }
        if let Some((token, _)) = rl.tokens.iter().find(|(_, p)| p.limit == 0) {
            return Err(TurnstileError::Config(format!(
                "limit for token '{}' must be > 0",
                token
            )));
        }
        if rl.token_header.is_empty() {
            return Err(TurnstileError::Config("rate_limiting.token_header must not be empty".into()));
        }
        if self.server.decision_timeout_ms == 0 {
            return Err(TurnstileError::Config("server.decision_timeout_ms must be > 0".into()));
        }
        if self.storage.memory.reclaim_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "storage.memory.reclaim_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
