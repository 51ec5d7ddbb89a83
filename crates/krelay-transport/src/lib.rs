//! Stream plumbing for the reverse tunnel core
//!
//! The tunnel core runs on top of a generic bidirectional framed stream;
//! the actual RPC framework is pluggable. This crate defines the typed
//! stream halves both sides program against, the RPC context (cancellation
//! plus deadline) threaded through every operation, and an in-memory
//! transport used by tests and in-process embedders.

pub mod context;
pub mod memory;
pub mod stream;

pub use context::{propagate_until, DetachHandle, RpcContext};
pub use stream::{
    AgentTunnel, IncomingStream, LocalDialer, LocalSink, LocalSource, LocalStream, ServerTunnel,
    StreamReceiver, StreamSender, TransportError, TunnelCallback, TunnelDialer,
};
