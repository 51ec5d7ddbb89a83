//! One registry stripe
//!
//! All state for an agent id lives in exactly one stripe: the set of ready
//! tunnels and the set of waiting find requests, both under one mutex.
//! Matching happens whenever either side arrives. The mutex is held only
//! across in-memory mutations and tracker calls; tracker implementations
//! must be fast.

use crate::tracker::TunnelTracker;
use crate::tunnel::{Tunnel, TunnelState};
use chrono::{DateTime, Utc};
use krelay_proto::{ConnectRequest, RpcStatus};
use krelay_transport::{RpcContext, ServerTunnel, StreamReceiver};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

struct FindRequest {
    service: String,
    method: String,
    ret: mpsc::Sender<Option<Arc<Tunnel>>>,
}

#[derive(Default)]
struct StripeState {
    tunnels_by_agent: HashMap<u64, HashMap<Uuid, Arc<Tunnel>>>,
    find_requests_by_agent: HashMap<u64, HashMap<Uuid, FindRequest>>,
}

pub(crate) struct RegistryStripe {
    tracker: Arc<dyn TunnelTracker>,
    state: Mutex<StripeState>,
}

/// Caller-side handle for a tunnel search. Obtain the tunnel with
/// [`FindHandle::get`]; always finish with [`FindHandle::done`] so a
/// tunnel delivered after the caller gave up goes back to the registry.
pub struct FindHandle {
    stripe: Arc<RegistryStripe>,
    agent_id: u64,
    request_id: Uuid,
    ret: mpsc::Receiver<Option<Arc<Tunnel>>>,
    got_tunnel: bool,
}

impl FindHandle {
    /// Wait for a matching tunnel. Returns RPC status errors only, ready
    /// to return from a stream handler.
    pub async fn get(&mut self, ctx: &RpcContext) -> Result<Arc<Tunnel>, RpcStatus> {
        tokio::select! {
            _ = ctx.done() => Err(ctx.status_error("FindTunnel request aborted")),
            delivered = self.ret.recv() => {
                self.got_tunnel = true;
                match delivered.flatten() {
                    Some(tunnel) => Ok(tunnel),
                    None => Err(RpcStatus::unavailable("server is shutting down")),
                }
            }
        }
    }

    /// Free this handle's resources. No-op if `get` returned a tunnel.
    pub fn done(mut self) {
        if self.got_tunnel {
            return;
        }
        let stripe = self.stripe.clone();
        stripe.abort_find(self.agent_id, self.request_id, &mut self.ret);
    }
}

impl RegistryStripe {
    pub(crate) fn new(tracker: Arc<dyn TunnelTracker>) -> Self {
        Self {
            tracker,
            state: Mutex::new(StripeState::default()),
        }
    }

    /// Register an agent's tunnel and block until it is used or the
    /// tunnel's context ends. The return value is what the tunnel's
    /// stream handler should return.
    pub(crate) async fn handle_tunnel(
        self: &Arc<Self>,
        ctx: &RpcContext,
        agent_id: u64,
        mut stream: ServerTunnel,
    ) -> Result<(), RpcStatus> {
        let first = stream
            .receiver
            .recv()
            .await
            .map_err(|err| err.to_status())?;
        let descriptor = match first {
            Some(ConnectRequest::Descriptor { descriptor }) => descriptor,
            Some(other) => {
                return Err(RpcStatus::invalid_argument(format!(
                    "invalid first message kind: tag {}",
                    other.tag()
                )))
            }
            None => {
                return Err(RpcStatus::invalid_argument(
                    "tunnel closed before descriptor",
                ))
            }
        };
        descriptor
            .validate()
            .map_err(|err| RpcStatus::invalid_argument(err.to_string()))?;

        let (ret_tx, mut ret_rx) = mpsc::channel(1);
        let tunnel = Arc::new(Tunnel::new(
            agent_id,
            descriptor,
            stream,
            ret_tx,
            Arc::downgrade(self),
        ));
        {
            let mut guard = self.state.lock().unwrap();
            self.register_tunnel_locked(&mut guard, &tunnel);
        }

        // Wait for the return value or for cancellation.
        tokio::select! {
            _ = ctx.done() => {
                enum AfterCancel {
                    Return,
                    WaitReturn,
                }
                let action = {
                    let mut guard = self.state.lock().unwrap();
                    match tunnel.state() {
                        TunnelState::Ready => {
                            tunnel.set_state(TunnelState::ContextDone);
                            self.unregister_tunnel_locked(&mut guard, &tunnel);
                            AfterCancel::Return
                        }
                        TunnelState::Found => {
                            // Found but not used yet: forward_stream will
                            // error out without doing any I/O.
                            tunnel.set_state(TunnelState::ContextDone);
                            AfterCancel::Return
                        }
                        // I/O on the stream will fail; the return value is
                        // on its way.
                        TunnelState::Forwarding | TunnelState::Done => AfterCancel::WaitReturn,
                        TunnelState::ContextDone => panic!("unreachable"),
                    }
                };
                match action {
                    AfterCancel::Return => Ok(()),
                    AfterCancel::WaitReturn => match ret_rx.recv().await {
                        Some(Some(status)) => Err(status),
                        _ => Ok(()),
                    },
                }
            }
            value = ret_rx.recv() => match value {
                Some(Some(status)) => Err(status),
                _ => Ok(()),
            },
        }
    }

    /// Start searching for a tunnel supporting (service, method) on the
    /// given agent. The boolean tells whether one was immediately
    /// available via the returned handle.
    pub(crate) fn find_tunnel(
        self: &Arc<Self>,
        agent_id: u64,
        service: &str,
        method: &str,
    ) -> (bool, FindHandle) {
        // Capacity 1 so delivery never blocks under the stripe mutex.
        let (ret_tx, ret_rx) = mpsc::channel(1);
        let request_id = Uuid::new_v4();
        let mut found = false;
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;

            // 1. A suitable ready tunnel?
            if let Some(tunnels) = state.tunnels_by_agent.get_mut(&agent_id) {
                let matching = tunnels
                    .iter()
                    .find(|(_, tunnel)| {
                        tunnel
                            .descriptor()
                            .supports_service_and_method(service, method)
                    })
                    .map(|(id, _)| *id);
                if let Some(tunnel_id) = matching {
                    if let Some(tunnel) = tunnels.remove(&tunnel_id) {
                        if tunnels.is_empty() {
                            state.tunnels_by_agent.remove(&agent_id);
                        }
                        tunnel.set_state(TunnelState::Found);
                        let _ = ret_tx.try_send(Some(tunnel));
                        if let Err(err) = self.tracker.unregister_tunnel(agent_id) {
                            warn!(agent_id, error = %err, "failed to unregister tunnel");
                        }
                        found = true;
                    }
                }
            }

            // 2. No suitable tunnel; queue the request.
            if !found {
                state
                    .find_requests_by_agent
                    .entry(agent_id)
                    .or_default()
                    .insert(
                        request_id,
                        FindRequest {
                            service: service.to_string(),
                            method: method.to_string(),
                            ret: ret_tx.clone(),
                        },
                    );
            }
        }
        (
            found,
            FindHandle {
                stripe: self.clone(),
                agent_id,
                request_id,
                ret: ret_rx,
                got_tunnel: false,
            },
        )
    }

    pub(crate) fn refresh(&self, next_expiry: DateTime<Utc>) -> Result<(), crate::tracker::TrackerError> {
        let _guard = self.state.lock().unwrap();
        self.tracker.refresh(next_expiry)
    }

    pub(crate) fn gc(&self) -> Result<usize, crate::tracker::TrackerError> {
        let _guard = self.state.lock().unwrap();
        self.tracker.gc()
    }

    /// Abort every ready tunnel and waiting find request. Ready tunnels
    /// get a clean return value so their agents reconnect immediately;
    /// waiting callers get an unavailable error.
    pub(crate) fn stop(&self) -> (usize, usize) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut stopped_tunnels = 0;
        let mut aborted_requests = 0;

        for (agent_id, tunnels) in state.tunnels_by_agent.drain() {
            for (_, tunnel) in tunnels {
                stopped_tunnels += 1;
                tunnel.set_state(TunnelState::Done);
                tunnel.deliver_return(None);
                if let Err(err) = self.tracker.unregister_tunnel(agent_id) {
                    warn!(agent_id, error = %err, "failed to unregister tunnel");
                }
            }
        }
        for (_, requests) in state.find_requests_by_agent.drain() {
            for (_, request) in requests {
                aborted_requests += 1;
                let _ = request.ret.try_send(None);
            }
        }
        (stopped_tunnels, aborted_requests)
    }

    pub(crate) fn ready_tunnel_count(&self) -> usize {
        let guard = self.state.lock().unwrap();
        guard.tunnels_by_agent.values().map(HashMap::len).sum()
    }

    pub(crate) fn waiting_request_count(&self) -> usize {
        let guard = self.state.lock().unwrap();
        guard
            .find_requests_by_agent
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// `Found -> Forwarding`, exactly once. Every other originating state
    /// is a caller error, reported as a status.
    pub(crate) fn on_tunnel_forward(&self, tunnel: &Tunnel) -> Result<(), RpcStatus> {
        let _guard = self.state.lock().unwrap();
        match tunnel.state() {
            TunnelState::Ready => Err(RpcStatus::internal(
                "unreachable: ready -> forwarding should never happen",
            )),
            TunnelState::Found => {
                tunnel.set_state(TunnelState::Forwarding);
                Ok(())
            }
            TunnelState::Forwarding => Err(RpcStatus::internal(
                "forward_stream() called more than once",
            )),
            TunnelState::Done => Err(RpcStatus::internal("forward_stream() called after done()")),
            TunnelState::ContextDone => {
                Err(RpcStatus::canceled("forward_stream() called on done stream"))
            }
        }
    }

    pub(crate) fn on_tunnel_done(&self, tunnel: &Arc<Tunnel>) {
        let mut guard = self.state.lock().unwrap();
        self.on_tunnel_done_locked(&mut guard, tunnel);
    }

    fn on_tunnel_done_locked(&self, state: &mut StripeState, tunnel: &Arc<Tunnel>) {
        match tunnel.state() {
            TunnelState::Ready => panic!("unreachable: ready -> done should never happen"),
            TunnelState::Found => {
                // Found but never used; put it back.
                self.register_tunnel_locked(state, tunnel);
            }
            TunnelState::Forwarding => tunnel.set_state(TunnelState::Done),
            TunnelState::Done => panic!("done() called more than once"),
            // done() after a cancelled context in handle_tunnel; nothing
            // to do.
            TunnelState::ContextDone => {}
        }
    }

    fn abort_find(
        &self,
        agent_id: u64,
        request_id: Uuid,
        ret: &mut mpsc::Receiver<Option<Arc<Tunnel>>>,
    ) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        ret.close();
        match ret.try_recv() {
            // A tunnel arrived after the caller gave up; return it to the
            // registry.
            Ok(Some(tunnel)) => self.on_tunnel_done_locked(state, &tunnel),
            _ => Self::delete_find_request_locked(state, agent_id, request_id),
        }
    }

    fn register_tunnel_locked(&self, state: &mut StripeState, tunnel: &Arc<Tunnel>) {
        let agent_id = tunnel.agent_id();

        // 1. A waiting find request for this tunnel's capabilities?
        if let Some(requests) = state.find_requests_by_agent.get_mut(&agent_id) {
            let matching = requests
                .iter()
                .find(|(_, request)| {
                    tunnel
                        .descriptor()
                        .supports_service_and_method(&request.service, &request.method)
                })
                .map(|(id, _)| *id);
            if let Some(request_id) = matching {
                if let Some(request) = requests.remove(&request_id) {
                    if requests.is_empty() {
                        state.find_requests_by_agent.remove(&agent_id);
                    }
                    tunnel.set_state(TunnelState::Found);
                    // Satisfy the waiting request; capacity 1 guarantees
                    // this never blocks.
                    let _ = request.ret.try_send(Some(tunnel.clone()));
                    return;
                }
            }
        }

        // 2. Register as ready.
        tunnel.set_state(TunnelState::Ready);
        state
            .tunnels_by_agent
            .entry(agent_id)
            .or_default()
            .insert(tunnel.id(), tunnel.clone());
        // Tracker calls never depend on the caller's context, so
        // unregistration always pairs up.
        if let Err(err) = self.tracker.register_tunnel(agent_id) {
            warn!(agent_id, error = %err, "failed to register tunnel");
        }
    }

    fn unregister_tunnel_locked(&self, state: &mut StripeState, tunnel: &Tunnel) {
        let agent_id = tunnel.agent_id();
        if let Some(tunnels) = state.tunnels_by_agent.get_mut(&agent_id) {
            tunnels.remove(&tunnel.id());
            if tunnels.is_empty() {
                state.tunnels_by_agent.remove(&agent_id);
            }
        }
        if let Err(err) = self.tracker.unregister_tunnel(agent_id) {
            warn!(agent_id, error = %err, "failed to unregister tunnel");
        }
    }

    fn delete_find_request_locked(state: &mut StripeState, agent_id: u64, request_id: Uuid) {
        if let Some(requests) = state.find_requests_by_agent.get_mut(&agent_id) {
            requests.remove(&request_id);
            if requests.is_empty() {
                state.find_requests_by_agent.remove(&agent_id);
            }
        }
    }
}
