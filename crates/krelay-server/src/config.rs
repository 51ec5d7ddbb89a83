//! Registry configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Log level for the shutdown path that aborts waiting callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortLogLevel {
    Warn,
    Error,
}

/// Configuration for the control-plane tunnel registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// The registry is sharded into `1 << stripe_bits` stripes keyed by
    /// agent id.
    pub stripe_bits: u8,
    /// How often tracker TTLs are re-announced.
    pub refresh_period: Duration,
    /// How often expired tracker records are deleted.
    pub gc_period: Duration,
    /// Overlap between refresh periods, so a concurrent GC on another
    /// instance does not delete data that is about to be refreshed.
    pub refresh_overlap: Duration,
    /// Level at which aborting still-waiting callers on shutdown is
    /// logged.
    pub shutdown_abort_log_level: AbortLogLevel,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stripe_bits: 8,
            refresh_period: Duration::from_secs(5 * 60),
            gc_period: Duration::from_secs(10 * 60),
            refresh_overlap: Duration::from_secs(5),
            shutdown_abort_log_level: AbortLogLevel::Warn,
        }
    }
}

/// Registry configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stripe_bits must be between 1 and 15, got {0}")]
    StripeBitsOutOfRange(u8),

    #[error("refresh_overlap must be shorter than refresh_period")]
    OverlapTooLong,

    #[error("refresh_period and gc_period must be non-zero")]
    ZeroPeriod,
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stripe_bits == 0 || self.stripe_bits > 15 {
            return Err(ConfigError::StripeBitsOutOfRange(self.stripe_bits));
        }
        if self.refresh_period.is_zero() || self.gc_period.is_zero() {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.refresh_overlap >= self.refresh_period {
            return Err(ConfigError::OverlapTooLong);
        }
        Ok(())
    }

    pub fn stripe_count(&self) -> u64 {
        1 << self.stripe_bits
    }
}
