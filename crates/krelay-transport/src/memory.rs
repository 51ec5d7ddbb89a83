//! In-memory transport
//!
//! Channel-backed tunnel streams with real close/EOF semantics. Used by
//! the test suites and by embedders that run agent and control plane in
//! one process.

use crate::context::RpcContext;
use crate::stream::{
    AgentTunnel, ServerTunnel, StreamReceiver, StreamSender, TransportError, TunnelDialer,
};
use async_trait::async_trait;
use krelay_proto::{ConnectRequest, ConnectResponse};
use tokio::sync::mpsc;

const STREAM_BUFFER: usize = 16;

/// Sending half backed by an mpsc channel. `close_send` drops the inner
/// sender so the peer observes clean EOF.
pub struct ChannelSender<T> {
    tx: Option<mpsc::Sender<T>>,
}

#[async_trait]
impl<T: Send> StreamSender<T> for ChannelSender<T> {
    async fn send(&mut self, msg: T) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| TransportError::StreamClosed),
            None => Err(TransportError::StreamClosed),
        }
    }

    async fn close_send(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

/// Receiving half backed by an mpsc channel.
pub struct ChannelReceiver<T> {
    rx: mpsc::Receiver<T>,
}

#[async_trait]
impl<T: Send> StreamReceiver<T> for ChannelReceiver<T> {
    async fn recv(&mut self) -> Result<Option<T>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// A connected pair of typed channel halves.
pub fn channel_pair<T: Send>() -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (ChannelSender { tx: Some(tx) }, ChannelReceiver { rx })
}

/// A connected tunnel: agent halves on one end, server halves on the other.
pub fn tunnel_pair() -> (AgentTunnel, ServerTunnel) {
    let (req_tx, req_rx) = channel_pair::<ConnectRequest>();
    let (resp_tx, resp_rx) = channel_pair::<ConnectResponse>();
    (
        AgentTunnel {
            sender: Box::new(req_tx),
            receiver: Box::new(resp_rx),
        },
        ServerTunnel {
            sender: Box::new(resp_tx),
            receiver: Box::new(req_rx),
        },
    )
}

/// Dialer handing each new tunnel's server end to an acceptor, like a
/// listener would.
pub struct MemoryTunnelDialer {
    accept_tx: mpsc::Sender<ServerTunnel>,
}

/// Accepts the server ends of tunnels opened through the paired dialer.
pub struct MemoryTunnelAcceptor {
    accept_rx: mpsc::Receiver<ServerTunnel>,
}

impl MemoryTunnelAcceptor {
    /// Next accepted tunnel; `None` once the dialer is gone.
    pub async fn accept(&mut self) -> Option<ServerTunnel> {
        self.accept_rx.recv().await
    }
}

/// A connected dialer/acceptor endpoint pair.
pub fn tunnel_endpoint() -> (MemoryTunnelDialer, MemoryTunnelAcceptor) {
    let (accept_tx, accept_rx) = mpsc::channel(STREAM_BUFFER);
    (
        MemoryTunnelDialer { accept_tx },
        MemoryTunnelAcceptor { accept_rx },
    )
}

#[async_trait]
impl TunnelDialer for MemoryTunnelDialer {
    async fn connect(&self, ctx: &RpcContext) -> Result<AgentTunnel, TransportError> {
        if ctx.is_done() {
            return Err(TransportError::Canceled);
        }
        let (agent, server) = tunnel_pair();
        self.accept_tx
            .send(server)
            .await
            .map_err(|_| TransportError::StreamClosed)?;
        Ok(agent)
    }
}
