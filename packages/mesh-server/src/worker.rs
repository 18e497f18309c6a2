//! Background workers for periodic mesh maintenance.
//!
//! A `BackgroundWorker<R>` ticks its `BackgroundRunnable` on a fixed interval
//! and also serves on-demand tasks from an mpsc channel, so an operator can
//! force a run between ticks and get its result back. Two runnables ship
//! with the mesh: the heartbeat sweep and the metrics snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use meshkit_core::MeshStatus;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::observer::MeshObserver;
use crate::registry::ServiceRegistry;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of on-demand task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Spawns a tokio task that serves submitted tasks and ticks periodically
/// until stopped.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the worker. The channel capacity is fixed at 64.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(64);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms.max(1)));
            // The first tick completes immediately; skip it.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues an on-demand task without waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or its queue is full.
    pub fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("worker not running"))?;
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("worker queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("worker channel closed"),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for its task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat sweep
// ---------------------------------------------------------------------------

/// Instances a sweep marked unhealthy, as `(service, instance_id)`.
pub type SweepReport = Vec<(String, String)>;

#[derive(Debug)]
pub enum SweepTask {
    /// Sweep immediately and reply with what changed.
    RunNow(oneshot::Sender<SweepReport>),
}

/// Marks instances whose heartbeats went stale as unhealthy.
pub struct HeartbeatSweeper {
    registry: Arc<ServiceRegistry>,
}

impl HeartbeatSweeper {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    fn sweep(&self) -> SweepReport {
        let stale = self.registry.sweep_stale();
        if !stale.is_empty() {
            info!(count = stale.len(), "heartbeat sweep marked instances unhealthy");
        }
        stale
    }
}

#[async_trait]
impl BackgroundRunnable for HeartbeatSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow(reply) => {
                let _ = reply.send(self.sweep());
            }
        }
    }

    async fn on_tick(&mut self) {
        let _ = self.sweep();
    }

    async fn shutdown(&mut self) {
        debug!("heartbeat sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// Metrics snapshot
// ---------------------------------------------------------------------------

/// Produces the status the snapshot worker publishes.
pub type StatusFn = Arc<dyn Fn() -> MeshStatus + Send + Sync>;

#[derive(Debug)]
pub enum SnapshotTask {
    /// Emit immediately and reply with the published status.
    EmitNow(oneshot::Sender<MeshStatus>),
}

/// Publishes a [`MeshStatus`] as gauges and to the observer on every tick.
pub struct MetricsSnapshotter {
    status: StatusFn,
    observer: Arc<dyn MeshObserver>,
}

impl MetricsSnapshotter {
    #[must_use]
    pub fn new(status: StatusFn, observer: Arc<dyn MeshObserver>) -> Self {
        Self { status, observer }
    }

    #[allow(clippy::cast_precision_loss)]
    fn emit(&self) -> MeshStatus {
        let status = (self.status)();
        metrics::gauge!("meshkit_services").set(status.services as f64);
        metrics::gauge!("meshkit_instances").set(status.instances as f64);
        metrics::gauge!("meshkit_instances_healthy").set(status.healthy_instances as f64);
        metrics::gauge!("meshkit_routes").set(status.routes as f64);
        metrics::gauge!("meshkit_breakers_open").set(status.circuit_breakers.open as f64);
        metrics::gauge!("meshkit_breakers_half_open")
            .set(status.circuit_breakers.half_open as f64);
        metrics::gauge!("meshkit_traces_active").set(status.active_traces as f64);
        metrics::gauge!("meshkit_dead_letters").set(status.dead_letter_size as f64);
        debug!(
            services = status.services,
            instances = status.instances,
            healthy = status.healthy_instances,
            "metrics snapshot"
        );
        self.observer.on_metrics_snapshot(&status);
        status
    }
}

#[async_trait]
impl BackgroundRunnable for MetricsSnapshotter {
    type Task = SnapshotTask;

    async fn run(&mut self, task: SnapshotTask) {
        match task {
            SnapshotTask::EmitNow(reply) => {
                let _ = reply.send(self.emit());
            }
        }
    }

    async fn on_tick(&mut self) {
        let _ = self.emit();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
