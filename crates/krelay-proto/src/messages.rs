//! Tunnel protocol message types
//!
//! A tunnel carries two directions of tagged messages. The agent sends
//! `ConnectRequest` values (descriptor first, then response data for the
//! in-flight RPC); the control plane sends `ConnectResponse` values
//! (request info, request data, half-close).

use crate::descriptor::AgentDescriptor;
use crate::status::RpcStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// RPC metadata: header/trailer maps of repeated string values.
pub type Metadata = HashMap<String, Vec<String>>;

/// Messages sent by the agent to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectRequest {
    /// Capability descriptor, sent exactly once as the first message on a
    /// new tunnel.
    Descriptor { descriptor: AgentDescriptor },
    /// Response headers from the in-cluster server.
    Header { meta: Metadata },
    /// One response message frame.
    Message { data: Vec<u8> },
    /// Response trailers, sent after the last message frame.
    Trailer { meta: Metadata },
    /// Terminal error status of the proxied RPC.
    Error { status: RpcStatus },
}

impl ConnectRequest {
    pub const DESCRIPTOR_TAG: u8 = 1;
    pub const HEADER_TAG: u8 = 2;
    pub const MESSAGE_TAG: u8 = 3;
    pub const TRAILER_TAG: u8 = 4;
    pub const ERROR_TAG: u8 = 5;

    /// Wire tag of this message kind. Tag numbers are stable; they must be
    /// preserved for wire compatibility.
    pub fn tag(&self) -> u8 {
        match self {
            ConnectRequest::Descriptor { .. } => Self::DESCRIPTOR_TAG,
            ConnectRequest::Header { .. } => Self::HEADER_TAG,
            ConnectRequest::Message { .. } => Self::MESSAGE_TAG,
            ConnectRequest::Trailer { .. } => Self::TRAILER_TAG,
            ConnectRequest::Error { .. } => Self::ERROR_TAG,
        }
    }
}

/// Messages sent by the control plane to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectResponse {
    /// Start of a proxied RPC: the method to invoke on the in-cluster
    /// server and the caller's metadata.
    RequestInfo { method_name: String, meta: Metadata },
    /// One request message frame.
    Message { data: Vec<u8> },
    /// The inbound caller finished sending.
    CloseSend,
}

impl ConnectResponse {
    pub const REQUEST_INFO_TAG: u8 = 1;
    pub const MESSAGE_TAG: u8 = 2;
    pub const CLOSE_SEND_TAG: u8 = 3;

    /// Wire tag of this message kind.
    pub fn tag(&self) -> u8 {
        match self {
            ConnectResponse::RequestInfo { .. } => Self::REQUEST_INFO_TAG,
            ConnectResponse::Message { .. } => Self::MESSAGE_TAG,
            ConnectResponse::CloseSend => Self::CLOSE_SEND_TAG,
        }
    }
}
