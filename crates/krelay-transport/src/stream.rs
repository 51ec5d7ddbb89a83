//! Typed stream seams for both sides of a tunnel
//!
//! A tunnel is a bidirectional stream of tagged messages; the framing and
//! the RPC framework underneath are pluggable. Send/receive halves are
//! split so each side can pipe both directions concurrently.

use crate::context::RpcContext;
use async_trait::async_trait;
use bytes::Bytes;
use krelay_proto::{CodecError, ConnectRequest, ConnectResponse, Metadata, RpcCode, RpcStatus};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the stream. On a send this is the signal to issue
    /// one receive and surface the real error, if any.
    #[error("stream closed")]
    StreamClosed,

    #[error("canceled")]
    Canceled,

    #[error("timeout")]
    Timeout,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Map a transport failure to the status surfaced to RPC callers.
    pub fn to_status(&self) -> RpcStatus {
        match self {
            TransportError::Canceled => RpcStatus::canceled(self.to_string()),
            TransportError::Timeout => RpcStatus::deadline_exceeded(self.to_string()),
            _ => RpcStatus::new(RpcCode::Unavailable, self.to_string()),
        }
    }

    pub fn is_canceled_or_timed_out(&self) -> bool {
        matches!(self, TransportError::Canceled | TransportError::Timeout)
    }
}

/// Sending half of a typed stream.
#[async_trait]
pub trait StreamSender<T>: Send {
    async fn send(&mut self, msg: T) -> Result<(), TransportError>;

    /// Half-close: signal that no more messages will be sent.
    async fn close_send(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a typed stream. `Ok(None)` is clean end of stream.
#[async_trait]
pub trait StreamReceiver<T>: Send {
    async fn recv(&mut self) -> Result<Option<T>, TransportError>;
}

/// Agent-side halves of a tunnel stream.
pub struct AgentTunnel {
    pub sender: Box<dyn StreamSender<ConnectRequest>>,
    pub receiver: Box<dyn StreamReceiver<ConnectResponse>>,
}

impl std::fmt::Debug for AgentTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTunnel").finish_non_exhaustive()
    }
}

/// Control-plane-side halves of an accepted tunnel stream.
pub struct ServerTunnel {
    pub sender: Box<dyn StreamSender<ConnectResponse>>,
    pub receiver: Box<dyn StreamReceiver<ConnectRequest>>,
}

/// Opens tunnel streams from the agent toward the control plane.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn connect(&self, ctx: &RpcContext) -> Result<AgentTunnel, TransportError>;
}

/// Sending half of a stream to the in-agent server.
#[async_trait]
pub trait LocalSink: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;
    async fn close_send(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a stream to the in-agent server. Client-stream
/// semantics: one header, then message frames until EOF or error, then
/// the trailer becomes available.
#[async_trait]
pub trait LocalSource: Send {
    async fn header(&mut self) -> Result<Metadata, RpcStatus>;
    async fn recv(&mut self) -> Result<Option<Bytes>, RpcStatus>;

    /// Valid once `recv` has returned `Ok(None)` or an error.
    fn trailer(&self) -> Metadata;
}

/// A stream opened against the in-agent server, split into halves.
pub struct LocalStream {
    pub sink: Box<dyn LocalSink>,
    pub source: Box<dyn LocalSource>,
}

/// Opens streams against the in-agent server for proxied requests.
#[async_trait]
pub trait LocalDialer: Send + Sync {
    async fn open_stream(
        &self,
        ctx: &RpcContext,
        method: &str,
        meta: &Metadata,
    ) -> Result<LocalStream, RpcStatus>;
}

/// The inbound RPC server-stream being piped through a tunnel.
#[async_trait]
pub trait IncomingStream: Send {
    fn method(&self) -> &str;
    fn metadata(&self) -> &Metadata;
    fn context(&self) -> &RpcContext;

    /// Next request frame from the inbound caller; `Ok(None)` on EOF.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Callbacks receiving tunnel output destined for the inbound caller.
/// It is the caller's responsibility to forward these into the inbound
/// stream.
#[async_trait]
pub trait TunnelCallback: Send {
    async fn header(&mut self, meta: Metadata) -> Result<(), RpcStatus>;
    async fn message(&mut self, data: Vec<u8>) -> Result<(), RpcStatus>;
    async fn trailer(&mut self, meta: Metadata) -> Result<(), RpcStatus>;

    /// A terminal error status arrived from the agent. Returns the error
    /// value to surface to the inbound caller.
    async fn error(&mut self, status: RpcStatus) -> RpcStatus;
}
