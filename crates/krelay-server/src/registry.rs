//! Sharded tunnel registry
//!
//! Matches inbound RPC requests to tunnels advertising the requested
//! service and method for a given agent id. Sharded by agent id so that
//! cross-shard coordination is never required.

use crate::config::{AbortLogLevel, ConfigError, RegistryConfig};
use crate::stripe::{FindHandle, RegistryStripe};
use crate::tracker::TunnelTracker;
use chrono::Utc;
use krelay_proto::RpcStatus;
use krelay_transport::{RpcContext, ServerTunnel};
use std::sync::Arc;
use tracing::{error, info, warn};

/// The control-plane tunnel registry.
pub struct TunnelRegistry {
    config: RegistryConfig,
    tracker: Arc<dyn TunnelTracker>,
    stripes: Vec<Arc<RegistryStripe>>,
}

impl TunnelRegistry {
    pub fn new(
        config: RegistryConfig,
        tracker: Arc<dyn TunnelTracker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let stripes = (0..config.stripe_count())
            .map(|_| Arc::new(RegistryStripe::new(tracker.clone())))
            .collect();
        Ok(Self {
            config,
            tracker,
            stripes,
        })
    }

    fn stripe_for(&self, agent_id: u64) -> &Arc<RegistryStripe> {
        let index = agent_id % self.stripes.len() as u64;
        &self.stripes[index as usize]
    }

    /// Handle a new tunnel from an agent: receive its descriptor, register
    /// it, and block until the tunnel is used or `ctx` ends. The return
    /// value is what the tunnel's stream handler should return.
    pub async fn handle_tunnel(
        &self,
        ctx: &RpcContext,
        agent_id: u64,
        stream: ServerTunnel,
    ) -> Result<(), RpcStatus> {
        self.stripe_for(agent_id)
            .handle_tunnel(ctx, agent_id, stream)
            .await
    }

    /// Start searching for a tunnel to the agent that supports the given
    /// service and method.
    pub fn find_tunnel(&self, agent_id: u64, service: &str, method: &str) -> (bool, FindHandle) {
        self.stripe_for(agent_id)
            .find_tunnel(agent_id, service, method)
    }

    /// Background maintenance: periodic tracker TTL refresh and GC. Runs
    /// until `ctx` ends, then stops the registry, aborting anything still
    /// registered or waiting.
    pub async fn run(&self, ctx: RpcContext) {
        let refresh_start = tokio::time::Instant::now() + self.config.refresh_period;
        let mut refresh = tokio::time::interval_at(refresh_start, self.config.refresh_period);
        let gc_start = tokio::time::Instant::now() + self.config.gc_period;
        let mut gc = tokio::time::interval_at(gc_start, self.config.gc_period);
        loop {
            tokio::select! {
                _ = ctx.done() => break,
                _ = refresh.tick() => self.refresh_registrations(),
                _ = gc.tick() => self.run_gc(),
            }
        }
        self.stop();
    }

    /// Abort all open tunnels and waiting find requests. Ready tunnels
    /// return cleanly so their agents reconnect; waiting callers get an
    /// unavailable error. Returns the number of each aborted.
    pub fn stop(&self) -> (usize, usize) {
        let mut stopped_tunnels = 0;
        let mut aborted_requests = 0;
        for stripe in &self.stripes {
            let (tunnels, requests) = stripe.stop();
            stopped_tunnels += tunnels;
            aborted_requests += requests;
        }
        if stopped_tunnels > 0 || aborted_requests > 0 {
            match self.config.shutdown_abort_log_level {
                AbortLogLevel::Warn => warn!(
                    num_tunnels = stopped_tunnels,
                    num_find_requests = aborted_requests,
                    "stopped tunnels and aborted find requests"
                ),
                AbortLogLevel::Error => error!(
                    num_tunnels = stopped_tunnels,
                    num_find_requests = aborted_requests,
                    "stopped tunnels and aborted find requests"
                ),
            }
        }
        (stopped_tunnels, aborted_requests)
    }

    /// URLs of control-plane instances currently holding tunnels for the
    /// agent, as recorded by the tracker.
    pub fn tunnel_server_urls(&self, agent_id: u64) -> Vec<String> {
        self.tracker.tunnel_server_urls(agent_id)
    }

    pub fn ready_tunnel_count(&self) -> usize {
        self.stripes.iter().map(|s| s.ready_tunnel_count()).sum()
    }

    pub fn waiting_request_count(&self) -> usize {
        self.stripes.iter().map(|s| s.waiting_request_count()).sum()
    }

    pub(crate) fn refresh_registrations(&self) {
        let ttl = self.config.refresh_period - self.config.refresh_overlap;
        let ttl = chrono::Duration::from_std(ttl).expect("refresh period out of range");
        let next_expiry = Utc::now() + ttl;
        for stripe in &self.stripes {
            if let Err(err) = stripe.refresh(next_expiry) {
                error!(error = %err, "failed to refresh tunnel registrations");
            }
        }
    }

    pub(crate) fn run_gc(&self) {
        let mut deleted = 0;
        for stripe in &self.stripes {
            match stripe.gc() {
                Ok(count) => deleted += count,
                Err(err) => error!(error = %err, "failed to gc tunnel registrations"),
            }
        }
        if deleted > 0 {
            info!(deleted, "deleted expired tunnel records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{MockTunnelTracker, NoopTracker};
    use krelay_proto::{AgentDescriptor, ConnectRequest, Service};
    use krelay_transport::memory::tunnel_pair;
    use krelay_transport::StreamSender;
    use std::time::Duration;

    fn small_config() -> RegistryConfig {
        RegistryConfig {
            stripe_bits: 2,
            ..RegistryConfig::default()
        }
    }

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor::new(vec![Service::new("S", ["M"])])
    }

    #[tokio::test]
    async fn test_tracker_register_unregister_pairing() {
        let mut tracker = MockTunnelTracker::new();
        tracker
            .expect_register_tunnel()
            .withf(|agent_id| *agent_id == 7)
            .times(1)
            .returning(|_| Ok(()));
        tracker
            .expect_unregister_tunnel()
            .withf(|agent_id| *agent_id == 7)
            .times(1)
            .returning(|_| Ok(()));
        let registry =
            Arc::new(TunnelRegistry::new(small_config(), Arc::new(tracker)).unwrap());

        let (mut agent, server) = tunnel_pair();
        agent
            .sender
            .send(ConnectRequest::Descriptor {
                descriptor: descriptor(),
            })
            .await
            .unwrap();

        let root = RpcContext::background();
        let (ctx, cancel) = root.child();
        let handle = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.handle_tunnel(&ctx, 7, server).await })
        };
        while registry.ready_tunnel_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Cancelling the tunnel's context unregisters it.
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(registry.ready_tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_and_gc_failures_are_swallowed() {
        let mut tracker = MockTunnelTracker::new();
        tracker
            .expect_refresh()
            .times(4)
            .returning(|_| Err(crate::tracker::TrackerError("store down".to_string())));
        tracker
            .expect_gc()
            .times(4)
            .returning(|| Err(crate::tracker::TrackerError("store down".to_string())));
        let registry = TunnelRegistry::new(small_config(), Arc::new(tracker)).unwrap();

        registry.refresh_registrations();
        registry.run_gc();
    }

    #[tokio::test]
    async fn test_gc_counts_deletions() {
        let mut tracker = MockTunnelTracker::new();
        tracker.expect_gc().times(4).returning(|| Ok(3));
        let registry = TunnelRegistry::new(small_config(), Arc::new(tracker)).unwrap();
        registry.run_gc();
    }

    #[tokio::test]
    async fn test_run_stops_on_context_end() {
        let registry =
            Arc::new(TunnelRegistry::new(small_config(), Arc::new(NoopTracker)).unwrap());
        let root = RpcContext::background();
        let (ctx, cancel) = root.child();
        let run = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run(ctx).await })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_agent_ids_spread_over_stripes() {
        let registry = TunnelRegistry::new(small_config(), Arc::new(NoopTracker)).unwrap();
        // 4 stripes with stripe_bits = 2; ids map by modulo.
        assert!(Arc::ptr_eq(registry.stripe_for(1), registry.stripe_for(5)));
        assert!(!Arc::ptr_eq(registry.stripe_for(1), registry.stripe_for(2)));
    }
}
