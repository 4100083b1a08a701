//! Client, pool, and retry configuration.

use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_ACTION_TIMEOUT_MS, DEFAULT_AMI_PORT,
    DEFAULT_CONNECT_TIMEOUT_MS,
};
use crate::error::{AmiError, AmiResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the pool picks among idle connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Rotate through idle connections in order.
    #[default]
    RoundRobin,
    /// Prefer the connection idle the longest.
    LeastRecentlyUsed,
    /// Pick uniformly at random.
    Random,
}

/// Pool sizing and health knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Connections opened eagerly at startup and kept as a floor.
    pub min_size: usize,
    /// Hard ceiling on total connections (idle + in use + being created).
    pub max_size: usize,
    /// How long an acquire waits for a connection before failing.
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Connections older than this are recycled instead of reused.
    #[serde(with = "duration_ms")]
    pub max_connection_age: Duration,
    /// Interval between background health sweeps.
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Consecutive failures before a connection is quarantined.
    pub max_consecutive_failures: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            max_connection_age: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30),
            max_consecutive_failures: 3,
        }
    }
}

/// Retry policy for transient action failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts, including the first. 1 disables retry.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Ceiling on any single backoff.
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Backoff growth factor between attempts.
    pub multiplier: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryOptions {
    /// Backoff to sleep after the given failed attempt (1-based).
    /// Grows by `multiplier` per attempt, capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        let raw = self.initial_backoff.saturating_mul(factor);
        raw.min(self.max_backoff)
    }
}

/// Full client configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Server hostname or address.
    pub host: String,
    /// Manager port.
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Login secret.
    pub password: String,
    /// TCP connect plus login handshake timeout.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Per-attempt action reply timeout.
    #[serde(with = "duration_ms")]
    pub action_timeout: Duration,
    /// Pool sizing and health.
    #[serde(default)]
    pub pool: PoolOptions,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryOptions,
    /// Idle-connection selection strategy.
    #[serde(default)]
    pub strategy: BalanceStrategy,
    /// Fully mask the port field in sanitized error context.
    #[serde(default)]
    pub mask_port_fully: bool,
}

impl ManagerConfig {
    /// Configuration with defaults for everything but the endpoint and
    /// credentials.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_AMI_PORT,
            username: username.into(),
            password: password.into(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            action_timeout: Duration::from_millis(DEFAULT_ACTION_TIMEOUT_MS),
            pool: PoolOptions::default(),
            retry: RetryOptions::default(),
            strategy: BalanceStrategy::default(),
            mask_port_fully: false,
        }
    }

    /// Fail-fast validation, run before any connection is attempted.
    pub fn validate(&self) -> AmiResult<()> {
        if self.host.is_empty() {
            return Err(AmiError::invalid_config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(AmiError::invalid_config("port must be non-zero"));
        }
        if self.username.is_empty() {
            return Err(AmiError::invalid_config("username must not be empty"));
        }
        if self.password.is_empty() {
            return Err(AmiError::invalid_config("password must not be empty"));
        }
        if self.pool.max_size == 0 {
            return Err(AmiError::invalid_config("pool.max_size must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(AmiError::invalid_config(
                "pool.min_size must not exceed pool.max_size",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AmiError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(AmiError::invalid_config(
                "retry.multiplier must be at least 1",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(AmiError::invalid_config("connect_timeout must be non-zero"));
        }
        if self.action_timeout.is_zero() {
            return Err(AmiError::invalid_config("action_timeout must be non-zero"));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(AmiError::invalid_config(
                "pool.acquire_timeout must be non-zero",
            ));
        }
        Ok(())
    }

    /// `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Keep the secret out of debug output.
impl fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .field("action_timeout", &self.action_timeout)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("strategy", &self.strategy)
            .field("mask_port_fully", &self.mask_port_fully)
            .finish()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
