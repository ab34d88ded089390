use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::shared::ValidationError;

/// Sizing and recycling settings of the connection pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Connections kept open even when idle. Established when the pool opens.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Upper bound on live connections. Acquisitions beyond it wait.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections older than this are closed instead of being reused.
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
    /// Idle connections unused for longer than this are closed.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Period of the background task recycling and replenishing connections.
    #[serde(default = "default_health_check_period_ms")]
    pub health_check_period_ms: u64,
    /// Wait applied by acquisitions that do not pass an explicit timeout.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub const DEFAULT_MIN_CONNECTIONS: u32 = 5;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 25;

    /// One hour.
    pub const DEFAULT_MAX_LIFETIME_MS: u64 = 60 * 60 * 1000;

    /// Thirty minutes.
    pub const DEFAULT_MAX_IDLE_MS: u64 = 30 * 60 * 1000;

    pub const DEFAULT_HEALTH_CHECK_PERIOD_MS: u64 = 60_000;

    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_millis(self.health_check_period_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                "pool.max_connections",
                "must be greater than 0",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ValidationError::invalid(
                "pool.min_connections",
                "must be <= max_connections",
            ));
        }

        if self.health_check_period_ms == 0 {
            return Err(ValidationError::invalid(
                "pool.health_check_period_ms",
                "must be greater than 0",
            ));
        }

        if self.max_lifetime_ms == 0 || self.max_idle_ms == 0 {
            return Err(ValidationError::invalid(
                "pool.max_lifetime_ms",
                "lifetime and idle limits must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            max_lifetime_ms: default_max_lifetime_ms(),
            max_idle_ms: default_max_idle_ms(),
            health_check_period_ms: default_health_check_period_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_min_connections() -> u32 {
    PoolConfig::DEFAULT_MIN_CONNECTIONS
}

fn default_max_connections() -> u32 {
    PoolConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_max_lifetime_ms() -> u64 {
    PoolConfig::DEFAULT_MAX_LIFETIME_MS
}

fn default_max_idle_ms() -> u64 {
    PoolConfig::DEFAULT_MAX_IDLE_MS
}

fn default_health_check_period_ms() -> u64 {
    PoolConfig::DEFAULT_HEALTH_CHECK_PERIOD_MS
}

fn default_acquire_timeout_ms() -> u64 {
    PoolConfig::DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    PoolConfig::DEFAULT_CONNECT_TIMEOUT_MS
}
