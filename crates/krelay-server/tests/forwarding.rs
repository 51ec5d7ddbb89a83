//! Stream forwarding scenarios: the full round trip, remote error status,
//! unique-use enforcement, cancellation, and the two-sided error values.

use async_trait::async_trait;
use bytes::Bytes;
use krelay_proto::{
    AgentDescriptor, ConnectRequest, ConnectResponse, Metadata, RpcCode, RpcStatus, Service,
};
use krelay_server::{NoopTracker, RegistryConfig, Tunnel, TunnelRegistry};
use krelay_transport::memory::tunnel_pair;
use krelay_transport::{
    AgentTunnel, IncomingStream, RpcContext, StreamReceiver, StreamSender, TransportError,
    TunnelCallback,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct FakeIncoming {
    method: String,
    metadata: Metadata,
    ctx: RpcContext,
    frames: VecDeque<Result<Option<Bytes>, TransportError>>,
}

impl FakeIncoming {
    fn new(
        method: &str,
        metadata: Metadata,
        ctx: RpcContext,
        frames: Vec<Result<Option<Bytes>, TransportError>>,
    ) -> Self {
        Self {
            method: method.to_string(),
            metadata,
            ctx,
            frames: frames.into(),
        }
    }
}

#[async_trait]
impl IncomingStream for FakeIncoming {
    fn method(&self) -> &str {
        &self.method
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn context(&self) -> &RpcContext {
        &self.ctx
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.frames.pop_front().unwrap_or(Ok(None))
    }
}

#[derive(Debug, PartialEq)]
enum Event {
    Header(Metadata),
    Message(Vec<u8>),
    Trailer(Metadata),
    Error(RpcStatus),
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
}

#[async_trait]
impl TunnelCallback for Recorder {
    async fn header(&mut self, meta: Metadata) -> Result<(), RpcStatus> {
        self.events.push(Event::Header(meta));
        Ok(())
    }

    async fn message(&mut self, data: Vec<u8>) -> Result<(), RpcStatus> {
        self.events.push(Event::Message(data));
        Ok(())
    }

    async fn trailer(&mut self, meta: Metadata) -> Result<(), RpcStatus> {
        self.events.push(Event::Trailer(meta));
        Ok(())
    }

    async fn error(&mut self, status: RpcStatus) -> RpcStatus {
        self.events.push(Event::Error(status.clone()));
        status
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn meta(key: &str, values: &[&str]) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(
        key.to_string(),
        values.iter().map(|v| v.to_string()).collect(),
    );
    meta
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Registry with one matched tunnel: the agent's stream halves, the found
/// tunnel, and the running handle_tunnel task.
async fn matched_tunnel(
    tunnel_ctx: RpcContext,
) -> (
    Arc<TunnelRegistry>,
    Arc<Tunnel>,
    AgentTunnel,
    JoinHandle<Result<(), RpcStatus>>,
) {
    let config = RegistryConfig {
        stripe_bits: 2,
        ..RegistryConfig::default()
    };
    let registry = Arc::new(TunnelRegistry::new(config, Arc::new(NoopTracker)).unwrap());
    let (mut agent, server) = tunnel_pair();
    agent
        .sender
        .send(ConnectRequest::Descriptor {
            descriptor: AgentDescriptor::new(vec![Service::new("S", ["M"])]),
        })
        .await
        .unwrap();
    let task = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.handle_tunnel(&tunnel_ctx, 42, server).await })
    };
    wait_for(|| registry.ready_tunnel_count() == 1, "tunnel registration").await;

    let (found, mut handle) = registry.find_tunnel(42, "S", "M");
    assert!(found);
    let tunnel = handle.get(&RpcContext::background()).await.unwrap();
    handle.done();
    (registry, tunnel, agent, task)
}

#[tokio::test]
async fn test_full_forwarding_round_trip() {
    init_tracing();
    let (_registry, tunnel, agent, tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let mut incoming = FakeIncoming::new(
        "/S/M",
        meta("cba", &["3", "4"]),
        RpcContext::background(),
        vec![Ok(Some(Bytes::from_static(&[1, 2, 3])))],
    );
    let mut recorder = Recorder::default();

    let agent_script = tokio::spawn(async move {
        let mut agent = agent;
        let mut seen = Vec::new();
        loop {
            let msg = agent.receiver.recv().await.unwrap().unwrap();
            let is_close = matches!(msg, ConnectResponse::CloseSend);
            seen.push(msg);
            if is_close {
                break;
            }
        }
        agent
            .sender
            .send(ConnectRequest::Header {
                meta: meta("resp", &["1", "2"]),
            })
            .await
            .unwrap();
        agent
            .sender
            .send(ConnectRequest::Message {
                data: vec![5, 6, 7],
            })
            .await
            .unwrap();
        agent
            .sender
            .send(ConnectRequest::Trailer {
                meta: meta("trailer", &["8", "9"]),
            })
            .await
            .unwrap();
        agent.sender.close_send().await.unwrap();
        seen
    });

    tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap();
    tunnel.done();

    let seen = agent_script.await.unwrap();
    assert_eq!(
        seen,
        vec![
            ConnectResponse::RequestInfo {
                method_name: "/S/M".to_string(),
                meta: meta("cba", &["3", "4"]),
            },
            ConnectResponse::Message {
                data: vec![1, 2, 3],
            },
            ConnectResponse::CloseSend,
        ]
    );
    assert_eq!(
        recorder.events,
        vec![
            Event::Header(meta("resp", &["1", "2"])),
            Event::Message(vec![5, 6, 7]),
            Event::Trailer(meta("trailer", &["8", "9"])),
        ]
    );

    // The tunnel's own handler returns cleanly.
    timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_remote_error_status_reaches_caller() {
    init_tracing();
    let (_registry, tunnel, agent, tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let mut incoming = FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let mut recorder = Recorder::default();

    let agent_script = tokio::spawn(async move {
        let mut agent = agent;
        loop {
            let msg = agent.receiver.recv().await.unwrap().unwrap();
            if matches!(msg, ConnectResponse::CloseSend) {
                break;
            }
        }
        agent
            .sender
            .send(ConnectRequest::Header {
                meta: Metadata::new(),
            })
            .await
            .unwrap();
        agent
            .sender
            .send(ConnectRequest::Error {
                status: RpcStatus::new(RpcCode::NotFound, "no such pod"),
            })
            .await
            .unwrap();
        agent.sender.close_send().await.unwrap();
    });

    let err = tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcCode::NotFound);
    tunnel.done();
    agent_script.await.unwrap();

    assert_eq!(
        recorder.events,
        vec![
            Event::Header(Metadata::new()),
            Event::Error(RpcStatus::new(RpcCode::NotFound, "no such pod")),
        ]
    );

    // The error was for the inbound caller only; the tunnel handler
    // returns cleanly.
    timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_descriptor_after_handshake_is_rejected() {
    init_tracing();
    let (_registry, tunnel, agent, tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let mut incoming = FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let mut recorder = Recorder::default();

    let agent_script = tokio::spawn(async move {
        let mut agent = agent;
        loop {
            let msg = agent.receiver.recv().await.unwrap().unwrap();
            if matches!(msg, ConnectResponse::CloseSend) {
                break;
            }
        }
        // A descriptor is only valid as the first message of a tunnel.
        agent
            .sender
            .send(ConnectRequest::Descriptor {
                descriptor: AgentDescriptor::new(vec![Service::new("S", ["M"])]),
            })
            .await
            .unwrap();
        agent.sender.close_send().await.unwrap();
    });

    let err = tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcCode::InvalidArgument);
    tunnel.done();
    agent_script.await.unwrap();
    assert!(recorder.events.is_empty());

    let tunnel_err = timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap_err();
    assert_eq!(tunnel_err.code, RpcCode::InvalidArgument);
}

#[tokio::test]
async fn test_forward_stream_is_single_use() {
    init_tracing();
    let (_registry, tunnel, agent, _tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let mut incoming = FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let mut recorder = Recorder::default();

    let agent_script = tokio::spawn(async move {
        let mut agent = agent;
        loop {
            let msg = agent.receiver.recv().await.unwrap().unwrap();
            if matches!(msg, ConnectResponse::CloseSend) {
                break;
            }
        }
        agent
            .sender
            .send(ConnectRequest::Header {
                meta: Metadata::new(),
            })
            .await
            .unwrap();
        agent
            .sender
            .send(ConnectRequest::Trailer {
                meta: Metadata::new(),
            })
            .await
            .unwrap();
        agent.sender.close_send().await.unwrap();
    });

    tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap();
    agent_script.await.unwrap();

    // Still in the forwarding state: a second forward is a caller error.
    let mut incoming2 =
        FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let err = tunnel
        .forward_stream(&mut incoming2, &mut recorder)
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcCode::Internal);

    tunnel.done();
    let mut incoming3 =
        FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let err = tunnel
        .forward_stream(&mut incoming3, &mut recorder)
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcCode::Internal);
}

#[tokio::test]
async fn test_forward_after_tunnel_context_done_fails_without_io() {
    init_tracing();
    let root = RpcContext::background();
    let (tunnel_ctx, cancel) = root.child();
    let (_registry, tunnel, mut agent, tunnel_task) = matched_tunnel(tunnel_ctx).await;

    // The tunnel's context ends while the tunnel is Found but unused.
    cancel.cancel();
    timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap();

    let mut incoming = FakeIncoming::new("/S/M", Metadata::new(), RpcContext::background(), vec![]);
    let mut recorder = Recorder::default();
    let err = tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcCode::Canceled);

    // No I/O happened on the tunnel.
    drop(tunnel);
    assert!(timeout(Duration::from_millis(50), agent.receiver.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_inbound_read_error_produces_two_different_errors() {
    init_tracing();
    let (_registry, tunnel, agent, tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let mut incoming = FakeIncoming::new(
        "/S/M",
        Metadata::new(),
        RpcContext::background(),
        vec![Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))],
    );
    let mut recorder = Recorder::default();

    let err = tunnel
        .forward_stream(&mut incoming, &mut recorder)
        .await
        .unwrap_err();
    // The inbound caller sees the original error...
    assert_eq!(err.code, RpcCode::Unavailable);
    tunnel.done();
    drop(agent);

    // ...while the tunnel handler gets a cancellation.
    let tunnel_err = timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap_err();
    assert_eq!(tunnel_err.code, RpcCode::Canceled);
    assert_eq!(tunnel_err.message, "read from incoming stream");
}

#[tokio::test]
async fn test_incoming_context_end_unblocks_stalled_tunnel_read() {
    init_tracing();
    let (_registry, tunnel, agent, tunnel_task) = matched_tunnel(RpcContext::background()).await;

    let root = RpcContext::background();
    let (incoming_ctx, cancel) = root.child();
    // No request frames: the inbound pipe finishes immediately, while the
    // agent never replies, stalling the tunnel read.
    let mut incoming = FakeIncoming::new("/S/M", Metadata::new(), incoming_ctx, vec![]);
    let mut recorder = Recorder::default();

    let canceler = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let err = timeout(
        Duration::from_secs(1),
        tunnel.forward_stream(&mut incoming, &mut recorder),
    )
    .await
    .expect("forward_stream did not unblock")
    .unwrap_err();
    assert_eq!(err.code, RpcCode::Canceled);
    tunnel.done();
    canceler.await.unwrap();
    drop(agent);

    let tunnel_err = timeout(Duration::from_secs(1), tunnel_task)
        .await
        .expect("handle_tunnel did not return")
        .unwrap()
        .unwrap_err();
    assert_eq!(tunnel_err.code, RpcCode::Canceled);
}
