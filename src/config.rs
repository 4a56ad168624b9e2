//! Configuration Module
//!
//! Handles loading and validating cache configuration from environment variables.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

// == Driver ==
/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// In-process sharded map with a background reaper
    Memory,
    /// Persistent store keyed by (identity digest, key digest)
    PersistentFast,
    /// Persistent store keyed by (identity digest, raw key)
    PersistentSafe,
    /// File-backed store; recognised but not available in this crate
    File,
    /// Remote store; recognised but not available in this crate
    Remote,
}

impl Driver {
    /// Canonical configuration name of the driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Memory => "memory",
            Driver::PersistentFast => "persistent-fast",
            Driver::PersistentSafe => "persistent-safe",
            Driver::File => "file",
            Driver::Remote => "remote",
        }
    }
}

impl FromStr for Driver {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Driver::Memory),
            "persistent-fast" | "fast" => Ok(Driver::PersistentFast),
            "persistent-safe" | "safe" | "persistent" => Ok(Driver::PersistentSafe),
            "file" => Ok(Driver::File),
            "remote" => Ok(Driver::Remote),
            other => Err(CacheError::UnknownDriver(other.to_string())),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Memory Tuning ==
/// Tuning for the in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// TTL applied by refresh operations when the caller passes none
    pub default_ttl: Option<Duration>,
    /// Interval between reaper sweeps, None = lazy expiry only
    pub reap_interval: Option<Duration>,
    /// Whether expiry callbacks are dispatched at all
    pub notify_expired: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(300)),
            reap_interval: Some(Duration::from_secs(1)),
            notify_expired: true,
        }
    }
}

// == Persistent Tuning ==
/// Tuning for the hash-indexed persistent backend.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// TTL applied by refresh operations when the caller passes none
    pub default_ttl: Option<Duration>,
    /// Interval between expiry sweeps, None = lazy expiry only
    pub sweep_interval: Option<Duration>,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(300)),
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Cache configuration parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend to build
    pub driver: Driver,
    /// Logical cache instance name, partitions keys sharing one physical store
    pub identity: String,
    /// In-memory backend tuning
    pub memory: MemoryConfig,
    /// Persistent backend tuning
    pub persistent: PersistentConfig,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DRIVER` - Backend selector (default: memory)
    /// - `CACHE_IDENTITY` - Instance name (default: default)
    /// - `CACHE_DEFAULT_TTL` - Refresh TTL in seconds, 0 disables (default: 300)
    /// - `CACHE_REAP_INTERVAL` - Memory reaper interval in milliseconds, 0 disables (default: 1000)
    /// - `CACHE_NOTIFY_EXPIRED` - Dispatch expiry callbacks (default: true)
    /// - `CACHE_SWEEP_INTERVAL` - Persistent sweep interval in milliseconds, 0 disables (default: 60000)
    ///
    /// Unparsable numbers fall back to their defaults; an unknown driver is an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let driver = match env::var("CACHE_DRIVER") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.driver,
        };

        let default_ttl = optional_duration("CACHE_DEFAULT_TTL", Duration::from_secs)
            .unwrap_or(defaults.memory.default_ttl);

        let config = Self {
            driver,
            identity: env::var("CACHE_IDENTITY").unwrap_or(defaults.identity),
            memory: MemoryConfig {
                default_ttl,
                reap_interval: optional_duration("CACHE_REAP_INTERVAL", Duration::from_millis)
                    .unwrap_or(defaults.memory.reap_interval),
                notify_expired: env::var("CACHE_NOTIFY_EXPIRED")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.memory.notify_expired),
            },
            persistent: PersistentConfig {
                default_ttl,
                sweep_interval: optional_duration("CACHE_SWEEP_INTERVAL", Duration::from_millis)
                    .unwrap_or(defaults.persistent.sweep_interval),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(CacheError::Configuration(
                "identity must not be empty".to_string(),
            ));
        }

        let durations = [
            ("memory.default_ttl", self.memory.default_ttl),
            ("memory.reap_interval", self.memory.reap_interval),
            ("persistent.default_ttl", self.persistent.default_ttl),
            ("persistent.sweep_interval", self.persistent.sweep_interval),
        ];
        for (name, value) in durations {
            if value == Some(Duration::ZERO) {
                return Err(CacheError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: Driver::Memory,
            identity: "default".to_string(),
            memory: MemoryConfig::default(),
            persistent: PersistentConfig::default(),
        }
    }
}

/// Reads an integer variable; `Some(None)` when it is 0, `None` when unset or unparsable.
fn optional_duration(name: &str, unit: fn(u64) -> Duration) -> Option<Option<Duration>> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|n| (n > 0).then(|| unit(n)))
}
