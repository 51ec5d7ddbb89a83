//! Control-plane side of the reverse tunnel core
//!
//! Agents dial outward and register tunnels here; inbound RPC handlers
//! find a tunnel advertising the requested service/method and pipe their
//! stream through it. The registry is sharded by agent id and enforces a
//! strict tunnel lifecycle.

pub mod config;
pub mod registry;
pub mod stripe;
pub mod tracker;
pub mod tunnel;

pub use config::{AbortLogLevel, ConfigError, RegistryConfig};
pub use registry::TunnelRegistry;
pub use stripe::FindHandle;
pub use tracker::{NoopTracker, TrackerError, TunnelTracker};
pub use tunnel::Tunnel;
