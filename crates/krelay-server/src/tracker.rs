//! Cluster-wide tunnel location tracking
//!
//! A multi-instance control plane records which instance currently holds
//! tunnels for an agent in an external store, so that any instance can
//! route a request to one that does. The store itself is out of scope;
//! this is the seam the registry drives.
//!
//! Implementations are called under a registry stripe lock and must be
//! fast: buffer internally, never wait on network I/O.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A failed tracker operation. Failures are logged, never retried.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TrackerError(pub String);

/// Records tunnel locations for routing across control-plane instances.
/// All operations are idempotent.
#[cfg_attr(test, mockall::automock)]
pub trait TunnelTracker: Send + Sync {
    /// This instance now holds at least one tunnel for the agent.
    fn register_tunnel(&self, agent_id: u64) -> Result<(), TrackerError>;

    /// This instance no longer holds a tunnel for the agent.
    fn unregister_tunnel(&self, agent_id: u64) -> Result<(), TrackerError>;

    /// Re-announce the TTL of every record this instance holds.
    fn refresh(&self, next_expiry: DateTime<Utc>) -> Result<(), TrackerError>;

    /// Delete expired records; returns the number deleted.
    fn gc(&self) -> Result<usize, TrackerError>;

    /// URLs of control-plane instances currently holding tunnels for the
    /// agent.
    fn tunnel_server_urls(&self, agent_id: u64) -> Vec<String>;
}

/// Tracker for deployments that do not participate in cross-instance
/// routing.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl TunnelTracker for NoopTracker {
    fn register_tunnel(&self, _agent_id: u64) -> Result<(), TrackerError> {
        Ok(())
    }

    fn unregister_tunnel(&self, _agent_id: u64) -> Result<(), TrackerError> {
        Ok(())
    }

    fn refresh(&self, _next_expiry: DateTime<Utc>) -> Result<(), TrackerError> {
        Ok(())
    }

    fn gc(&self) -> Result<usize, TrackerError> {
        Ok(0)
    }

    fn tunnel_server_urls(&self, _agent_id: u64) -> Vec<String> {
        Vec::new()
    }
}
