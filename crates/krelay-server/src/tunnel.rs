//! A registered tunnel and the stream forwarder
//!
//! A tunnel wraps one accepted outbound stream from an agent. Once matched
//! to an inbound RPC it pipes the two streams together full-duplex,
//! producing two error values: one returned to the tunnel's own stream
//! handler and one returned to the inbound caller.

use crate::stripe::RegistryStripe;
use krelay_proto::{AgentDescriptor, ConnectRequest, ConnectResponse, RpcStatus};
use krelay_transport::{
    IncomingStream, ServerTunnel, StreamReceiver, StreamSender, TransportError, TunnelCallback,
};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tunnel lifecycle states. Transitions happen under the stripe mutex;
/// illegal transitions are bugs in the registry and panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelState {
    /// Owned by the registry, ready to be found.
    Ready,
    /// Handed to a caller, not yet used for forwarding.
    Found,
    /// Actively piping a matched RPC.
    Forwarding,
    /// Forwarding finished.
    Done,
    /// The tunnel's own context ended before the tunnel was used.
    ContextDone,
}

/// A control-plane tunnel: one accepted outbound stream from an agent,
/// advertising an immutable capability descriptor.
pub struct Tunnel {
    id: Uuid,
    agent_id: u64,
    descriptor: AgentDescriptor,
    state: Mutex<TunnelState>,
    io: Mutex<Option<ServerTunnel>>,
    ret: mpsc::Sender<Option<RpcStatus>>,
    stripe: Weak<RegistryStripe>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish()
    }
}

impl Tunnel {
    pub(crate) fn new(
        agent_id: u64,
        descriptor: AgentDescriptor,
        stream: ServerTunnel,
        ret: mpsc::Sender<Option<RpcStatus>>,
        stripe: Weak<RegistryStripe>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            descriptor,
            state: Mutex::new(TunnelState::Ready),
            io: Mutex::new(Some(stream)),
            ret,
            stripe,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent_id(&self) -> u64 {
        self.agent_id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub(crate) fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: TunnelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Deliver the value the tunnel's stream handler returns. The sink has
    /// capacity one and receives at most one value over the tunnel's
    /// lifetime.
    pub(crate) fn deliver_return(&self, value: Option<RpcStatus>) {
        let _ = self.ret.try_send(value);
    }

    /// Pipe the inbound stream and this tunnel into each other until both
    /// directions complete. Callbacks receive header, messages, trailer
    /// and error status coming from the tunnel; forwarding them into the
    /// inbound stream is the caller's job.
    ///
    /// Usable exactly once, on a tunnel obtained from a find.
    pub async fn forward_stream(
        self: &Arc<Self>,
        incoming: &mut dyn IncomingStream,
        cb: &mut dyn TunnelCallback,
    ) -> Result<(), RpcStatus> {
        match self.stripe.upgrade() {
            Some(stripe) => stripe.on_tunnel_forward(self)?,
            None => return Err(RpcStatus::unavailable("registry stopped")),
        }
        let pair = self.forward(incoming, cb).await;
        self.deliver_return(pair.for_tunnel);
        match pair.for_incoming {
            None => Ok(()),
            Some(status) => Err(status),
        }
    }

    /// Must be called when the caller is done with the tunnel. A matched
    /// but unused tunnel goes back into the registry's ready set.
    pub fn done(self: &Arc<Self>) {
        if let Some(stripe) = self.stripe.upgrade() {
            stripe.on_tunnel_done(self);
        }
    }

    async fn forward(
        &self,
        incoming: &mut dyn IncomingStream,
        cb: &mut dyn TunnelCallback,
    ) -> ErrPair {
        let ServerTunnel {
            mut sender,
            mut receiver,
        } = self
            .io
            .lock()
            .unwrap()
            .take()
            .expect("tunnel stream taken more than once");
        let incoming_ctx = incoming.context().clone();
        let agent_id = self.agent_id;

        // Pipe the inbound request stream into the tunnel.
        let inbound_to_tunnel = async move {
            let info = ConnectResponse::RequestInfo {
                method_name: incoming.method().to_string(),
                meta: incoming.metadata().clone(),
            };
            if let Err(err) = sender.send(info).await {
                return ErrPair::both(send_error_status(
                    agent_id,
                    "send request info to tunnel",
                    &err,
                ));
            }
            loop {
                match incoming.recv().await {
                    Ok(Some(data)) => {
                        let msg = ConnectResponse::Message {
                            data: data.to_vec(),
                        };
                        if let Err(err) = sender.send(msg).await {
                            return ErrPair::both(send_error_status(
                                agent_id,
                                "send message to tunnel",
                                &err,
                            ));
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        return ErrPair {
                            for_tunnel: Some(RpcStatus::canceled("read from incoming stream")),
                            for_incoming: Some(err.to_status()),
                        }
                    }
                }
            }
            if let Err(err) = sender.send(ConnectResponse::CloseSend).await {
                return ErrPair::both(send_error_status(
                    agent_id,
                    "send close-send to tunnel",
                    &err,
                ));
            }
            ErrPair::clean()
        };

        // Pipe the tunnel into the inbound stream via the callbacks.
        let tunnel_to_inbound = async move {
            let mut for_incoming = None;
            loop {
                match receiver.recv().await {
                    Ok(Some(ConnectRequest::Descriptor { .. })) => {
                        return ErrPair::both(RpcStatus::invalid_argument(
                            "unexpected descriptor after handshake",
                        ));
                    }
                    Ok(Some(ConnectRequest::Header { meta })) => {
                        if let Err(status) = cb.header(meta).await {
                            return ErrPair::both(status);
                        }
                    }
                    Ok(Some(ConnectRequest::Message { data })) => {
                        if let Err(status) = cb.message(data).await {
                            return ErrPair::both(status);
                        }
                    }
                    Ok(Some(ConnectRequest::Trailer { meta })) => {
                        if let Err(status) = cb.trailer(meta).await {
                            return ErrPair::both(status);
                        }
                    }
                    Ok(Some(ConnectRequest::Error { status })) => {
                        // The agent closes the stream right after this
                        // message; keep consuming until EOF so the stream
                        // is fully drained.
                        for_incoming = Some(cb.error(status).await);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let status = err.to_status();
                        return ErrPair {
                            for_tunnel: Some(status.clone()),
                            for_incoming: Some(status),
                        };
                    }
                }
            }
            ErrPair {
                for_tunnel: None,
                for_incoming,
            }
        };

        tokio::pin!(inbound_to_tunnel);
        tokio::pin!(tunnel_to_inbound);

        enum Remaining {
            InboundToTunnel,
            TunnelToInbound,
        }

        let (pair, remaining) = tokio::select! {
            pair = &mut inbound_to_tunnel => (pair, Remaining::TunnelToInbound),
            pair = &mut tunnel_to_inbound => (pair, Remaining::InboundToTunnel),
        };
        if !pair.is_clean() {
            return pair;
        }
        // The first pipe finished cleanly. Wait for the second, but watch
        // the incoming context: if it ends now, synthesize an error for
        // both directions so a stalled tunnel receive unblocks.
        match remaining {
            Remaining::TunnelToInbound => tokio::select! {
                pair = &mut tunnel_to_inbound => pair,
                _ = incoming_ctx.done() => {
                    ErrPair::both(incoming_ctx.status_error("incoming stream closed"))
                }
            },
            Remaining::InboundToTunnel => tokio::select! {
                pair = &mut inbound_to_tunnel => pair,
                _ = incoming_ctx.done() => {
                    ErrPair::both(incoming_ctx.status_error("incoming stream closed"))
                }
            },
        }
    }
}

/// The forwarder's two error values: one for the tunnel's stream handler,
/// one for the inbound caller. They may differ.
#[derive(Debug, Clone, Default)]
struct ErrPair {
    for_tunnel: Option<RpcStatus>,
    for_incoming: Option<RpcStatus>,
}

impl ErrPair {
    fn clean() -> Self {
        Self::default()
    }

    fn both(status: RpcStatus) -> Self {
        Self {
            for_tunnel: Some(status.clone()),
            for_incoming: Some(status),
        }
    }

    fn is_clean(&self) -> bool {
        self.for_tunnel.is_none() && self.for_incoming.is_none()
    }
}

fn send_error_status(agent_id: u64, what: &str, err: &TransportError) -> RpcStatus {
    if err.is_canceled_or_timed_out() {
        debug!(agent_id, error = %err, "{what}");
    } else {
        warn!(agent_id, error = %err, "{what}");
    }
    err.to_status()
}
