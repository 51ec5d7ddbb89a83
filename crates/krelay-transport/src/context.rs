//! RPC context: cancellation and deadlines
//!
//! Mirrors the shape the rest of the core needs from a request context:
//! a cancellation signal, an optional deadline, and a way to turn the
//! cause of termination into an RPC status.

use krelay_proto::RpcStatus;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A cancellable context with an optional deadline.
///
/// Cheap to clone; clones observe the same cancellation signal.
#[derive(Debug, Clone)]
pub struct RpcContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RpcContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context plus a handle cancelling only the child.
    /// Cancelling the parent cancels the child; not vice versa.
    pub fn child(&self) -> (Self, CancellationToken) {
        let child = self.token.child_token();
        (
            Self {
                token: child.clone(),
                deadline: self.deadline,
            },
            child,
        )
    }

    /// Derive a child context with a deadline `timeout` from now. If the
    /// parent deadline is earlier, the parent's is kept.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancellationToken) {
        let (mut ctx, cancel) = self.child();
        let deadline = Instant::now() + timeout;
        ctx.deadline = Some(match ctx.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        (ctx, cancel)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Status describing why this context ended: `DeadlineExceeded` if the
    /// deadline fired, `Canceled` otherwise.
    pub fn status_error(&self, message: &str) -> RpcStatus {
        if self.deadline_expired() {
            RpcStatus::deadline_exceeded(format!("{message}: deadline exceeded"))
        } else {
            RpcStatus::canceled(format!("{message}: context canceled"))
        }
    }
}

/// One-shot handle severing the cancellation link created by
/// [`propagate_until`]. Dropping the handle also severs the link.
#[derive(Debug)]
pub struct DetachHandle {
    _stop: oneshot::Sender<()>,
}

impl DetachHandle {
    /// Stop propagating the parent's cancellation. Cancellation of the
    /// parent context after this call no longer reaches the derived
    /// context; the derived context stays cancellable via its own token.
    pub fn detach(self) {}
}

/// Derive a context that mirrors cancellation from `parent` until the
/// returned [`DetachHandle`] severs the link.
///
/// The returned token cancels the derived context directly and keeps
/// working after detachment. The auxiliary task exits no matter which of
/// the three signals fires first.
pub fn propagate_until(parent: &RpcContext) -> (RpcContext, CancellationToken, DetachHandle) {
    let child = CancellationToken::new();
    let cancel = child.clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let parent = parent.clone();
    let link = child.clone();
    tokio::spawn(async move {
        // biased so that a detach that happened before the parent's
        // cancellation reliably wins when both are observed in one poll.
        tokio::select! {
            biased;
            _ = stop_rx => {}
            _ = link.cancelled() => {}
            _ = parent.done() => link.cancel(),
        }
    });
    (
        RpcContext {
            token: child,
            deadline: None,
        },
        cancel,
        DetachHandle { _stop: stop_tx },
    )
}
