//! Pool configuration types

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidepool_core::{PoolError, Result};

use crate::retry::BackoffStrategy;

/// What happens to an overflow slot when its borrower returns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Overflow slots are closed on release so the pool shrinks back to `base_size`
    #[default]
    Burst,
    /// Overflow slots stay idle until recycled, reaped or explicitly shrunk
    Retain,
}

/// Configuration for a connection pool
///
/// Controls pool sizing, timeouts, validation and connection lifecycle.
/// Durations are stored in milliseconds so the struct round-trips through
/// TOML and JSON unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of core connections the pool keeps alive
    base_size: usize,
    /// Number of temporary connections allowed beyond `base_size`
    max_overflow: usize,
    /// Timeout in milliseconds when acquiring a connection from the pool
    acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds before it's recycled
    recycle_after_ms: Option<u64>,
    /// Timeout in milliseconds before an idle connection is reaped by the sweeper
    idle_timeout_ms: Option<u64>,
    /// Whether to ping a connection before handing it out
    validate_on_checkout: bool,
    /// Whether overflow connections survive release
    overflow_policy: OverflowPolicy,
    /// Timeout in milliseconds for a single liveness probe
    ping_timeout_ms: u64,
    /// Retries of a transient connect failure before it is surfaced
    connect_retries: u32,
    /// Delay between connect retries
    connect_backoff: BackoffStrategy,
    /// Total tries at producing a connection that passes validation
    checkout_attempts: u32,
    /// Interval in milliseconds between background sweeps
    sweep_interval_ms: u64,
}

impl PoolConfig {
    /// Create a new pool configuration with the given core and overflow sizes
    pub fn new(base_size: usize, max_overflow: usize) -> Self {
        Self {
            base_size,
            max_overflow,
            acquire_timeout_ms: 30_000, // 30 seconds default
            recycle_after_ms: None,
            idle_timeout_ms: None,
            validate_on_checkout: false,
            overflow_policy: OverflowPolicy::Burst,
            ping_timeout_ms: 5_000,
            connect_retries: 2,
            connect_backoff: BackoffStrategy::default(),
            checkout_attempts: 3,
            sweep_interval_ms: 30_000,
        }
    }

    /// Parse a configuration from TOML and validate it
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file and validate it
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading pool configuration");
        Self::from_toml_str(&source)
    }

    /// Check that the configuration describes a usable pool
    pub fn validate(&self) -> Result<()> {
        if self.base_size == 0 {
            return Err(PoolError::Configuration(
                "base_size must be greater than 0".into(),
            ));
        }
        if self.checkout_attempts == 0 {
            return Err(PoolError::Configuration(
                "checkout_attempts must be at least 1".into(),
            ));
        }
        if self.ping_timeout_ms == 0 {
            return Err(PoolError::Configuration(
                "ping_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(PoolError::Configuration(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }
        if self.recycle_after_ms == Some(0) {
            return Err(PoolError::Configuration(
                "recycle_after_ms must be greater than 0 when set".into(),
            ));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(PoolError::Configuration(
                "idle_timeout_ms must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    /// Set the acquire timeout in milliseconds
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum connection lifetime in milliseconds
    pub fn with_recycle_after_ms(mut self, lifetime_ms: u64) -> Self {
        self.recycle_after_ms = Some(lifetime_ms);
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn with_idle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = Some(timeout_ms);
        self
    }

    /// Enable or disable pre-ping on checkout
    pub fn with_validate_on_checkout(mut self, validate: bool) -> Self {
        self.validate_on_checkout = validate;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_ping_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ping_timeout_ms = timeout_ms;
        self
    }

    /// Set how many times a transient connect failure is retried
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_connect_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.connect_backoff = backoff;
        self
    }

    pub fn with_checkout_attempts(mut self, attempts: u32) -> Self {
        self.checkout_attempts = attempts;
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    /// Get the number of core slots
    pub fn base_size(&self) -> usize {
        self.base_size
    }

    /// Get the number of overflow slots allowed
    pub fn max_overflow(&self) -> usize {
        self.max_overflow
    }

    /// Upper bound on live physical connections
    pub fn max_size(&self) -> usize {
        self.base_size + self.max_overflow
    }

    /// Get the acquire timeout as a Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get the maximum lifetime as a Duration if set
    pub fn recycle_after(&self) -> Option<Duration> {
        self.recycle_after_ms.map(Duration::from_millis)
    }

    /// Get the idle timeout as a Duration if set
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate_on_checkout(&self) -> bool {
        self.validate_on_checkout
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_retries(&self) -> u32 {
        self.connect_retries
    }

    pub fn connect_backoff(&self) -> &BackoffStrategy {
        &self.connect_backoff
    }

    pub fn checkout_attempts(&self) -> u32 {
        self.checkout_attempts
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for PoolConfig {
    /// Create a default pool configuration
    ///
    /// Defaults:
    /// - base_size: 5
    /// - max_overflow: 10
    /// - acquire_timeout: 30 seconds
    /// - recycle_after / idle_timeout: None
    /// - validate_on_checkout: false
    fn default() -> Self {
        Self::new(5, 10)
    }
}
