//! Admin server lifecycle.
//!
//! The lifecycle token is a child of the mesh's shutdown token, so stopping
//! the mesh also stops the admin listener. Handlers that act on the mesh hold
//! a [`RequestGuard`]; draining waits on a `Notify` fired when the last guard
//! drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

#[derive(Debug)]
pub struct AdminLifecycle {
    state: ArcSwap<ServerState>,
    cancel: CancellationToken,
    in_flight: Arc<InFlight>,
}

impl AdminLifecycle {
    /// Creates a lifecycle that starts draining when `parent` is cancelled.
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            state: ArcSwap::from_pointee(ServerState::Starting),
            cancel: parent.child_token(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Current state. A cancelled lifecycle that has not finished draining
    /// reports `Draining` even before the serve loop notices.
    #[must_use]
    pub fn state(&self) -> ServerState {
        let state = **self.state.load();
        match state {
            ServerState::Starting | ServerState::Ready if self.cancel.is_cancelled() => {
                ServerState::Draining
            }
            other => other,
        }
    }

    pub fn mark_ready(&self) {
        if !self.cancel.is_cancelled() {
            self.state.store(Arc::new(ServerState::Ready));
        }
    }

    /// Stops accepting mesh work and wakes the serve loop.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(ServerState::Draining));
        self.cancel.cancel();
    }

    /// Resolves once draining has begun, from either side.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Tracks one request until the guard drops. `None` once draining.
    #[must_use]
    pub fn track(&self) -> Option<RequestGuard> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        Some(RequestGuard {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits for tracked requests to finish, up to `timeout`. Moves to
    /// `Stopped` and returns `true` once idle; otherwise stays `Draining`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.in_flight.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(timeout, idle).await.is_ok();
        if drained {
            self.state.store(Arc::new(ServerState::Stopped));
        }
        drained
    }
}

/// Held by a handler while it acts on the mesh.
#[derive(Debug)]
pub struct RequestGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
