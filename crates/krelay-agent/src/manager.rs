//! Outbound connection pool
//!
//! Maintains a pool of outbound tunnel attempts sized between `min_idle`
//! and `max_connections`. Growth is triggered only by a connection turning
//! active; shrinkage only by idleness expiry. There is no periodic scan.

use crate::config::AgentConfig;
use async_trait::async_trait;
use krelay_transport::RpcContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

/// A single outbound tunnel attempt loop, driven by the pool.
#[async_trait]
pub trait TunnelConnection: Send + Sync + 'static {
    /// Runs attempts until the poll context ends.
    async fn run(&self, poll_ctx: RpcContext);
}

/// Pool callbacks a connection invokes as it changes state.
#[derive(Clone)]
pub struct ConnectionCallbacks {
    /// The connection started serving a request.
    pub on_active: Arc<dyn Fn() + Send + Sync>,
    /// The connection finished an attempt and is idle again.
    pub on_idle: Arc<dyn Fn() + Send + Sync>,
}

impl ConnectionCallbacks {
    pub fn noop() -> Self {
        Self {
            on_active: Arc::new(|| {}),
            on_idle: Arc::new(|| {}),
        }
    }
}

/// Builds a connection wired to the given pool callbacks.
pub type ConnectionFactory =
    Arc<dyn Fn(ConnectionCallbacks) -> Arc<dyn TunnelConnection> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    Active,
    Stopped,
}

struct ConnectionRecord {
    cancel: CancellationToken,
    state: ConnectionState,
    last_active: Instant,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<Uuid, ConnectionRecord>,
    idle: u32,
    active: u32,
    root: Option<RpcContext>,
}

/// Pool counters, as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: u32,
    pub active: u32,
    pub total: usize,
}

/// Manages a pool of connections and their lifecycles.
pub struct ConnectionManager {
    config: AgentConfig,
    factory: ConnectionFactory,
    state: Mutex<PoolState>,
    tasks: TaskTracker,
}

impl ConnectionManager {
    pub fn new(config: AgentConfig, factory: ConnectionFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            tasks: TaskTracker::new(),
        })
    }

    /// Fill the pool to `min_idle`, then block until `ctx` ends. On exit,
    /// waits for every spawned connection to terminate. Connection errors
    /// are never propagated; connections reconnect with backoff on their
    /// own.
    pub async fn run(self: &Arc<Self>, ctx: RpcContext) {
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.root = Some(ctx.clone());
            while state.idle < self.config.min_idle {
                self.start_connection_locked(&ctx, state);
            }
        }
        ctx.done().await;
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            idle: state.idle,
            active: state.active,
            total: state.connections.len(),
        }
    }

    fn start_connection_locked(self: &Arc<Self>, root: &RpcContext, state: &mut PoolState) {
        state.idle += 1;
        let id = Uuid::new_v4();
        let (conn_ctx, cancel) = root.child();
        let weak = Arc::downgrade(self);
        let callbacks = ConnectionCallbacks {
            on_active: {
                let weak = weak.clone();
                Arc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_active(id);
                    }
                })
            },
            on_idle: {
                let weak = weak.clone();
                Arc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_idle(id);
                    }
                })
            },
        };
        let connection = (self.factory)(callbacks);
        state.connections.insert(
            id,
            ConnectionRecord {
                cancel,
                state: ConnectionState::Idle,
                last_active: Instant::now(),
            },
        );
        debug!(connection_id = %id, "starting connection");
        self.tasks.spawn(async move {
            connection.run(conn_ctx).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_stop(id);
            }
        });
    }

    fn on_active(self: &Arc<Self>, id: Uuid) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let current = state.connections.get(&id).map(|r| r.state);
        match current {
            // Stopped or already removed: the connection is on its way
            // out, nothing to do.
            None | Some(ConnectionState::Stopped) => {}
            Some(ConnectionState::Active) => panic!("connection is already active"),
            Some(ConnectionState::Idle) => {
                if let Some(record) = state.connections.get_mut(&id) {
                    record.state = ConnectionState::Active;
                }
                state.idle -= 1;
                state.active += 1;
                if state.idle < self.config.min_idle {
                    if let Some(root) = state.root.clone() {
                        // Not enough idle connections. Scale up without
                        // going above the limit.
                        let have = state.idle + state.active;
                        let can_spawn = self.config.max_connections.saturating_sub(have);
                        let scale_by = self.config.scale_up_step.min(can_spawn);
                        for _ in 0..scale_by {
                            self.start_connection_locked(&root, state);
                        }
                    }
                }
            }
        }
    }

    fn on_idle(&self, id: Uuid) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let current = state.connections.get(&id).map(|r| r.state);
        match current {
            None | Some(ConnectionState::Stopped) => {}
            Some(ConnectionState::Active) => {
                if let Some(record) = state.connections.get_mut(&id) {
                    record.state = ConnectionState::Idle;
                    record.last_active = Instant::now();
                }
                state.idle += 1;
                state.active -= 1;
            }
            Some(ConnectionState::Idle) => {
                // The idle counter drops here, not in on_stop, so
                // concurrent on_idle calls cannot cascade-terminate pool
                // members.
                if state.idle > self.config.min_idle {
                    let mut stopped = false;
                    if let Some(record) = state.connections.get_mut(&id) {
                        if record.last_active.elapsed() > self.config.max_idle_time {
                            record.cancel.cancel();
                            record.state = ConnectionState::Stopped;
                            stopped = true;
                        }
                    }
                    if stopped {
                        state.idle -= 1;
                        debug!(connection_id = %id, "stopping expired idle connection");
                    }
                }
            }
        }
    }

    fn on_stop(&self, id: Uuid) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(record) = state.connections.remove(&id) {
            if record.state != ConnectionState::Stopped {
                // on_idle decrements the counter when it stops a
                // connection itself; this covers context-cancelled
                // termination.
                state.idle = state.idle.saturating_sub(1);
            }
        }
        debug!(connection_id = %id, "connection stopped");
    }
}
