//! Reverse Tunnel Protocol Definitions
//!
//! This crate defines the message types exchanged over a reverse tunnel
//! stream, the agent capability descriptor, and the status codes used to
//! report RPC outcomes across the tunnel.

pub mod codec;
pub mod descriptor;
pub mod messages;
pub mod status;

pub use codec::{decode_request, decode_response, encode_request, encode_response, CodecError};
pub use descriptor::{AgentDescriptor, Method, Service, ValidationError};
pub use messages::{ConnectRequest, ConnectResponse, Metadata};
pub use status::{RpcCode, RpcStatus};
