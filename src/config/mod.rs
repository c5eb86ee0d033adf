// ABOUTME: Client configuration - pool sizing, timeouts, retry and subscription knobs
//
// ClientConfig is immutable once built. It comes from either the validating
// builder or a TOML document; both paths run the same validation so a bad
// value fails at construction, never at first use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::pool::selection::LoadBalancing;
use crate::retry::RetryPolicy;
use crate::subscription::strategy::SubscriptionStrategy;

/// URI schemes the pool knows how to hand to a connector.
pub const SUPPORTED_SCHEMES: &[&str] = &["ws", "wss", "http", "https", "mem"];

/// Configuration errors, raised at build/load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Circuit breaker thresholds applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time an open circuit waits before a half-open probe
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Everything the client runtime reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint handed to the connector
    pub uri: String,

    // === Pool sizing ===
    pub min_connections: usize,
    pub max_connections: usize,

    /// Let several callers share one connection
    pub allow_multiplexing: bool,

    pub load_balancing: LoadBalancing,

    // === Timeouts ===
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Longest `acquire()` waits for an eligible connection
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    /// Pending subscribe attempts older than this count as a connection failure
    #[serde(with = "duration_ms")]
    pub subscribe_timeout: Duration,

    /// Request tracker expiry for unacknowledged ids
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    // === Subscriptions ===
    /// Forces a wire strategy regardless of query count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_strategy_override: Option<SubscriptionStrategy>,

    /// Query counts above this use the batched strategy
    pub multi_query_threshold: usize,

    // === Resilience (tables last so TOML output stays valid) ===
    pub circuit_breaker: CircuitBreakerConfig,

    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri: "ws://127.0.0.1:3000".to_string(),

            min_connections: 1,
            max_connections: 4,
            allow_multiplexing: false,
            load_balancing: LoadBalancing::RoundRobin,

            health_check_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),

            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::standard(),

            subscription_strategy_override: None,
            multi_query_threshold: 5,
        }
    }
}

impl ClientConfig {
    /// Start a builder for the given endpoint.
    pub fn builder(uri: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self {
                uri: uri.into(),
                ..Self::default()
            },
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML (durations in milliseconds).
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Parsed endpoint. Only valid after `validate()` succeeded.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.uri).map_err(|e| ConfigError::InvalidUri {
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::InvalidUri {
                uri: self.uri.clone(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Check every cross-field constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        for (name, value) in [
            ("health_check_interval", self.health_check_interval),
            ("acquire_timeout", self.acquire_timeout),
            ("connect_timeout", self.connect_timeout),
            ("probe_timeout", self.probe_timeout),
            ("subscribe_timeout", self.subscribe_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.multi_query_threshold == 0 {
            return Err(ConfigError::Invalid("multi_query_threshold must be at least 1".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder; `build()` runs validation.
#[derive(Debug, Clone)]
#[must_use]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub const fn connections(mut self, min: usize, max: usize) -> Self {
        self.config.min_connections = min;
        self.config.max_connections = max;
        self
    }

    pub const fn min_connections(mut self, min: usize) -> Self {
        self.config.min_connections = min;
        self
    }

    pub const fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub const fn allow_multiplexing(mut self, allow: bool) -> Self {
        self.config.allow_multiplexing = allow;
        self
    }

    pub const fn load_balancing(mut self, strategy: LoadBalancing) -> Self {
        self.config.load_balancing = strategy;
        self
    }

    pub const fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub const fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub const fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.config.subscribe_timeout = timeout;
        self
    }

    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub const fn circuit_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold,
            cooldown,
        };
        self
    }

    pub const fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub const fn strategy_override(mut self, strategy: Option<SubscriptionStrategy>) -> Self {
        self.config.subscription_strategy_override = strategy;
        self
    }

    pub const fn multi_query_threshold(mut self, threshold: usize) -> Self {
        self.config.multi_query_threshold = threshold;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde helper for Duration as milliseconds (u64)
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
