//! A single outbound tunnel attempt
//!
//! Each connection repeatedly dials the control plane, advertises the
//! agent's capability descriptor and then acts as a local proxy: it reads
//! request info from the tunnel, opens a stream against the in-agent
//! server and pipes bytes in both directions until EOF.

use crate::manager::{ConnectionCallbacks, TunnelConnection};
use crate::retry::{AttemptResult, BackoffPolicy, PollConfig};
use async_trait::async_trait;
use bytes::Bytes;
use krelay_proto::{AgentDescriptor, ConnectRequest, ConnectResponse, RpcStatus};
use krelay_transport::{
    propagate_until, AgentTunnel, LocalDialer, LocalSink, LocalSource, RpcContext, StreamReceiver,
    StreamSender, TransportError, TunnelDialer,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Errors from a single tunnel attempt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connect(): {0}")]
    Connect(TransportError),

    #[error("Send(descriptor): {0}")]
    SendDescriptor(TransportError),

    #[error("Recv(): {0}")]
    Recv(TransportError),

    #[error("open local stream: {0}")]
    LocalOpen(RpcStatus),

    #[error("send to local stream: {0}")]
    LocalSend(TransportError),

    #[error("close local stream: {0}")]
    LocalCloseSend(TransportError),

    #[error("read from local stream: {0}")]
    LocalRecv(RpcStatus),

    #[error("send to tunnel: {0}")]
    TunnelSend(TransportError),

    #[error("close tunnel stream: {0}")]
    TunnelCloseSend(TransportError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl ConnectionError {
    /// Cancellations and timeouts re-establish the tunnel immediately;
    /// everything else backs off.
    pub fn is_canceled_or_timed_out(&self) -> bool {
        match self {
            ConnectionError::Connect(err)
            | ConnectionError::SendDescriptor(err)
            | ConnectionError::Recv(err)
            | ConnectionError::LocalSend(err)
            | ConnectionError::LocalCloseSend(err)
            | ConnectionError::TunnelSend(err)
            | ConnectionError::TunnelCloseSend(err) => err.is_canceled_or_timed_out(),
            ConnectionError::LocalOpen(status) | ConnectionError::LocalRecv(status) => {
                status.is_canceled_or_timed_out()
            }
            ConnectionError::Protocol(_) => false,
        }
    }
}

/// One outbound tunnel attempt loop under a retry/backoff policy. Within
/// each attempt it proxies exactly one inbound request, or zero if the
/// tunnel is closed before one arrives.
pub struct Connection {
    descriptor: AgentDescriptor,
    tunnel_dialer: Arc<dyn TunnelDialer>,
    local_dialer: Arc<dyn LocalDialer>,
    poll_config: PollConfig,
    callbacks: ConnectionCallbacks,
}

impl Connection {
    pub fn new(
        descriptor: AgentDescriptor,
        tunnel_dialer: Arc<dyn TunnelDialer>,
        local_dialer: Arc<dyn LocalDialer>,
        poll_config: PollConfig,
        callbacks: ConnectionCallbacks,
    ) -> Self {
        Self {
            descriptor,
            tunnel_dialer,
            local_dialer,
            poll_config,
            callbacks,
        }
    }

    pub(crate) async fn attempt(&self, poll_ctx: &RpcContext) -> Result<(), ConnectionError> {
        let (ctx, cancel, detach) = propagate_until(poll_ctx);
        let _cancel_guard = cancel.clone().drop_guard();
        let mut detach = Some(detach);

        let AgentTunnel {
            mut sender,
            mut receiver,
        } = self
            .tunnel_dialer
            .connect(&ctx)
            .await
            .map_err(ConnectionError::Connect)?;

        let first = ConnectRequest::Descriptor {
            descriptor: self.descriptor.clone(),
        };
        if let Err(err) = sender.send(first).await {
            let err = match err {
                // The send failed because the stream ended; one receive
                // surfaces the real error.
                TransportError::StreamClosed => match receiver.recv().await {
                    Err(real) => real,
                    Ok(_) => TransportError::StreamClosed,
                },
                other => other,
            };
            return Err(ConnectionError::SendDescriptor(err));
        }

        let mut tunnel_sender = Some(sender);
        let mut local_sink: Option<Box<dyn LocalSink>> = None;
        let mut downstream = None;

        let visited: Result<(), ConnectionError> = 'visit: loop {
            let msg = tokio::select! {
                biased;
                msg = receiver.recv() => match msg {
                    Ok(msg) => msg,
                    Err(err) => break 'visit Err(ConnectionError::Recv(err)),
                },
                _ = ctx.done() => break 'visit Err(ConnectionError::Recv(TransportError::Canceled)),
            };
            let Some(msg) = msg else {
                break 'visit Ok(());
            };
            match msg {
                ConnectResponse::RequestInfo { method_name, meta } => {
                    (self.callbacks.on_active)();
                    let local = match self
                        .local_dialer
                        .open_stream(&ctx, &method_name, &meta)
                        .await
                    {
                        Ok(local) => local,
                        Err(status) => break 'visit Err(ConnectionError::LocalOpen(status)),
                    };
                    let Some(tunnel) = tunnel_sender.take() else {
                        break 'visit Err(ConnectionError::Protocol("duplicate request info"));
                    };
                    // From here on, cancellation of the pool context must
                    // not interrupt the running request.
                    if let Some(detach) = detach.take() {
                        detach.detach();
                    }
                    local_sink = Some(local.sink);
                    downstream = Some(tokio::spawn(pipe_local_into_tunnel(tunnel, local.source)));
                }
                ConnectResponse::Message { data } => {
                    let Some(sink) = local_sink.as_mut() else {
                        break 'visit Err(ConnectionError::Protocol("message before request info"));
                    };
                    match sink.send(Bytes::from(data)).await {
                        Ok(()) => {}
                        // The downstream pipe observes the real error.
                        Err(TransportError::StreamClosed) => {}
                        Err(err) => break 'visit Err(ConnectionError::LocalSend(err)),
                    }
                }
                ConnectResponse::CloseSend => {
                    let Some(sink) = local_sink.as_mut() else {
                        break 'visit Err(ConnectionError::Protocol(
                            "close send before request info",
                        ));
                    };
                    if let Err(err) = sink.close_send().await {
                        break 'visit Err(ConnectionError::LocalCloseSend(err));
                    }
                }
            }
        };

        if visited.is_err() {
            cancel.cancel();
        }
        let piped = match downstream {
            Some(handle) => handle.await.expect("downstream pipe task panicked"),
            None => Ok(()),
        };
        // The tunnel-visitor error wins unless it is clean.
        visited.and(piped)
    }
}

#[async_trait]
impl TunnelConnection for Connection {
    async fn run(&self, poll_ctx: RpcContext) {
        let mut backoff = BackoffPolicy::new(self.poll_config.clone());
        while !poll_ctx.is_done() {
            let result = self.attempt(&poll_ctx).await;
            (self.callbacks.on_idle)();
            let next = match result {
                Ok(()) => {
                    debug!("handled a connection successfully");
                    AttemptResult::ContinueImmediately
                }
                Err(err) if err.is_canceled_or_timed_out() => {
                    debug!(error = %err, "canceled connection");
                    AttemptResult::ContinueImmediately
                }
                Err(err) => {
                    error!(error = %err, "error handling a connection");
                    AttemptResult::Backoff
                }
            };
            if next == AttemptResult::Backoff {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = poll_ctx.done() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        debug!("connection done");
    }
}

/// Pipe the local server's responses back into the tunnel: header, then
/// message frames, then trailer, then either a clean half-close or an
/// error status.
async fn pipe_local_into_tunnel(
    mut tunnel: Box<dyn StreamSender<ConnectRequest>>,
    mut local: Box<dyn LocalSource>,
) -> Result<(), ConnectionError> {
    let header = match local.header().await {
        Ok(meta) => meta,
        Err(status) => return send_error_to_tunnel(tunnel.as_mut(), status).await,
    };
    match tunnel.send(ConnectRequest::Header { meta: header }).await {
        Ok(()) => {}
        // The visitor observes the real error in its receive.
        Err(TransportError::StreamClosed) => return Ok(()),
        Err(err) => return Err(ConnectionError::TunnelSend(err)),
    }
    loop {
        match local.recv().await {
            Ok(Some(data)) => {
                let msg = ConnectRequest::Message {
                    data: data.to_vec(),
                };
                match tunnel.send(msg).await {
                    Ok(()) => {}
                    Err(TransportError::StreamClosed) => return Ok(()),
                    Err(err) => return Err(ConnectionError::TunnelSend(err)),
                }
            }
            done => {
                // The trailer becomes available once recv returns EOF or
                // an error.
                let trailer = local.trailer();
                if let Err(err) = tunnel.send(ConnectRequest::Trailer { meta: trailer }).await {
                    return match done {
                        // The read error happened first; report it.
                        Err(status) => Err(ConnectionError::LocalRecv(status)),
                        _ => match err {
                            TransportError::StreamClosed => Ok(()),
                            err => Err(ConnectionError::TunnelSend(err)),
                        },
                    };
                }
                match done {
                    Ok(_) => break,
                    Err(status) => return send_error_to_tunnel(tunnel.as_mut(), status).await,
                }
            }
        }
    }
    match tunnel.close_send().await {
        Ok(()) => Ok(()),
        Err(err) => Err(ConnectionError::TunnelCloseSend(err)),
    }
}

async fn send_error_to_tunnel(
    tunnel: &mut dyn StreamSender<ConnectRequest>,
    status: RpcStatus,
) -> Result<(), ConnectionError> {
    match tunnel.send(ConnectRequest::Error { status }).await {
        Ok(()) => {}
        Err(TransportError::StreamClosed) => return Ok(()),
        Err(err) => return Err(ConnectionError::TunnelSend(err)),
    }
    match tunnel.close_send().await {
        Ok(()) => Ok(()),
        Err(err) => Err(ConnectionError::TunnelCloseSend(err)),
    }
}
