//! Agent-side reverse tunnel pool
//!
//! An agent behind NAT dials outward to the control plane and keeps a pool
//! of idle tunnels ready to carry RPCs in reverse. The pool grows on
//! demand, reaps expired idle tunnels and reconnects with backoff.

pub mod config;
pub mod connection;
pub mod manager;
pub mod retry;

pub use config::{AgentConfig, ConfigError};
pub use connection::{Connection, ConnectionError};
pub use manager::{
    ConnectionCallbacks, ConnectionFactory, ConnectionManager, PoolStats, TunnelConnection,
};
pub use retry::{AttemptResult, BackoffPolicy, PollConfig};
