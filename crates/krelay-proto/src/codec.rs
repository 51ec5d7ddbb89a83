//! Wire codec for tunnel messages
//!
//! Each message is encoded as a 1-byte wire tag followed by the bincode
//! payload of the message body. Length delimiting is the transport's job.

use crate::descriptor::AgentDescriptor;
use crate::messages::{ConnectRequest, ConnectResponse, Metadata};
use crate::status::RpcStatus;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire tag: {0}")]
    UnknownTag(u8),

    #[error("empty frame")]
    EmptyFrame,

    #[error("payload error: {0}")]
    Payload(#[from] bincode::Error),
}

/// Encode an agent-to-server message.
pub fn encode_request(msg: &ConnectRequest) -> Result<Bytes, CodecError> {
    let payload = match msg {
        ConnectRequest::Descriptor { descriptor } => bincode::serialize(descriptor)?,
        ConnectRequest::Header { meta } => bincode::serialize(meta)?,
        ConnectRequest::Message { data } => bincode::serialize(data)?,
        ConnectRequest::Trailer { meta } => bincode::serialize(meta)?,
        ConnectRequest::Error { status } => bincode::serialize(status)?,
    };
    Ok(frame(msg.tag(), &payload))
}

/// Decode an agent-to-server message.
pub fn decode_request(mut buf: Bytes) -> Result<ConnectRequest, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let tag = buf.get_u8();
    let msg = match tag {
        ConnectRequest::DESCRIPTOR_TAG => ConnectRequest::Descriptor {
            descriptor: bincode::deserialize::<AgentDescriptor>(&buf)?,
        },
        ConnectRequest::HEADER_TAG => ConnectRequest::Header {
            meta: bincode::deserialize::<Metadata>(&buf)?,
        },
        ConnectRequest::MESSAGE_TAG => ConnectRequest::Message {
            data: bincode::deserialize::<Vec<u8>>(&buf)?,
        },
        ConnectRequest::TRAILER_TAG => ConnectRequest::Trailer {
            meta: bincode::deserialize::<Metadata>(&buf)?,
        },
        ConnectRequest::ERROR_TAG => ConnectRequest::Error {
            status: bincode::deserialize::<RpcStatus>(&buf)?,
        },
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(msg)
}

/// Encode a server-to-agent message.
pub fn encode_response(msg: &ConnectResponse) -> Result<Bytes, CodecError> {
    let payload = match msg {
        ConnectResponse::RequestInfo { method_name, meta } => {
            bincode::serialize(&(method_name, meta))?
        }
        ConnectResponse::Message { data } => bincode::serialize(data)?,
        ConnectResponse::CloseSend => Vec::new(),
    };
    Ok(frame(msg.tag(), &payload))
}

/// Decode a server-to-agent message.
pub fn decode_response(mut buf: Bytes) -> Result<ConnectResponse, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let tag = buf.get_u8();
    let msg = match tag {
        ConnectResponse::REQUEST_INFO_TAG => {
            let (method_name, meta) = bincode::deserialize::<(String, Metadata)>(&buf)?;
            ConnectResponse::RequestInfo { method_name, meta }
        }
        ConnectResponse::MESSAGE_TAG => ConnectResponse::Message {
            data: bincode::deserialize::<Vec<u8>>(&buf)?,
        },
        ConnectResponse::CLOSE_SEND_TAG => ConnectResponse::CloseSend,
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(msg)
}

fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}
