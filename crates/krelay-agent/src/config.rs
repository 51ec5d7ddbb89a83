//! Agent-side tunnel pool configuration

use crate::retry::PollConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the outbound tunnel pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Minimum number of connections not currently serving a request.
    pub min_idle: u32,
    /// Maximum number of connections, idle and active combined.
    pub max_connections: u32,
    /// Number of new connections to start when idleness drops below
    /// `min_idle`.
    pub scale_up_step: u32,
    /// How long a connection may stay idle before it is shut down.
    pub max_idle_time: Duration,
    /// Reconnection backoff parameters.
    pub poll: PollConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_connections: 100,
            scale_up_step: 10,
            max_idle_time: Duration::from_secs(60),
            poll: PollConfig::default(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("min_idle ({min_idle}) must not exceed max_connections ({max_connections})")]
    MinIdleAboveMax { min_idle: u32, max_connections: u32 },

    #[error("max_connections must be at least 1")]
    ZeroMaxConnections,

    #[error("scale_up_step must be at least 1")]
    ZeroScaleUpStep,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.scale_up_step == 0 {
            return Err(ConfigError::ZeroScaleUpStep);
        }
        if self.min_idle > self.max_connections {
            return Err(ConfigError::MinIdleAboveMax {
                min_idle: self.min_idle,
                max_connections: self.max_connections,
            });
        }
        Ok(())
    }
}
