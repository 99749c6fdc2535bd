//! The per-job QoS manager.
//!
//! One worker per job is *elected* manager by the coordinator; on that
//! worker the manager daemon owns the [`QosModel`] and is the only thread
//! that ever mutates the graph. Reports, role deployments, and chain
//! announcements are handed off through an unbounded queue; a periodic tick
//! on the adjustment interval scans the assembled graph for constraint
//! violations and lets the buffer-size controller react.
//!
//! ```text
//! reports / deployments / announces            adjustment tick
//!            │                                       │
//!            ▼                                       ▼
//!   ┌─────────────────┐   mutates   ┌──────────────────────────────┐
//!   │  ManagerWorker  │ ──────────► │ QosModel ── ViolationFinder  │
//!   └─────────────────┘             └──────────────┬───────────────┘
//!                                                  │ violations
//!                                                  ▼
//!                                   BufferSizeManager ──► dispatcher
//! ```

pub mod buffers;
pub mod model;
pub mod violation;

pub use model::{InvalidChain, ModelState, QosModel};

use crate::config::QosPluginConfig;
use crate::dispatcher::DispatcherClient;
use crate::graph::ShallowGraphFragment;
use crate::ids::JobId;
use crate::messages::{QosReport, StreamChainAnnounce};
use crate::time::unix_millis;
use buffers::BufferSizeManager;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work handed off to the manager daemon.
#[derive(Debug)]
pub enum ManagerEvent {
    /// A QoS report from some reporter worker (possibly this one).
    Report(QosReport),
    /// This worker has been elected manager; merge the shallow graph and
    /// constraints delivered with the role.
    DeployManagerRole(ShallowGraphFragment),
    /// Mark a constructed chain's edges in the model.
    ChainAnnounce(StreamChainAnnounce),
}

/// Handle to a running manager daemon.
///
/// Created lazily by the per-job environment on the first manager-role
/// message or QoS report; hand-off is fire-and-forget.
pub struct QosManager {
    tx: mpsc::UnboundedSender<ManagerEvent>,
    shutdown: CancellationToken,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl QosManager {
    /// Spawns the manager daemon for `job` on the given runtime.
    pub fn spawn(
        job: JobId,
        config: &QosPluginConfig,
        dispatcher: DispatcherClient,
        runtime_handle: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = ManagerWorker {
            job,
            rx,
            model: QosModel::new(
                job,
                config.aggregation_interval_ms,
                config.adjustment_interval_ms,
            ),
            buffers: BufferSizeManager::new(job, dispatcher, config.adjustment_interval_ms),
            adjustment_interval: Duration::from_millis(config.adjustment_interval_ms.max(1)),
        };

        let worker_shutdown = shutdown.clone();
        let worker_handle = runtime_handle.spawn(async move {
            worker.run(worker_shutdown).await;
        });

        Self {
            tx,
            shutdown,
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    /// Enqueues an event; never blocks. Events after shutdown are dropped.
    pub fn hand_off(&self, event: ManagerEvent) {
        let _ = self.tx.send(event);
    }

    /// Stops the daemon after it finishes the current event. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for QosManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosManager")
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

struct ManagerWorker {
    job: JobId,
    rx: mpsc::UnboundedReceiver<ManagerEvent>,
    model: QosModel,
    buffers: BufferSizeManager,
    adjustment_interval: Duration,
}

impl ManagerWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        info!(job = %self.job, "QoS manager starting");

        let mut scan_interval = tokio::time::interval(self.adjustment_interval);
        scan_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    break;
                }

                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.process_event(event),
                        None => break,
                    }
                }

                _ = scan_interval.tick() => {
                    self.scan_for_violations(unix_millis());
                }
            }
        }

        debug!(job = %self.job, "QoS manager stopped");
    }

    fn process_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Report(report) => {
                self.model.process_report(&report);
            }
            ManagerEvent::DeployManagerRole(fragment) => {
                info!(
                    job = %self.job,
                    groups = fragment.group_vertices.len(),
                    constraints = fragment.constraints.len(),
                    "merging shallow QoS graph"
                );
                self.model.merge_shallow(&fragment);
            }
            ManagerEvent::ChainAnnounce(announce) => {
                if let Err(e) = self.model.process_chain_announce(&announce) {
                    warn!(job = %self.job, error = %e, "dropping chain announce");
                }
            }
        }
    }

    fn scan_for_violations(&mut self, now_ms: u64) {
        if !self.model.is_ready() {
            return;
        }
        self.buffers.begin_scan(now_ms);
        self.model.find_violations(&mut self.buffers, now_ms);
    }
}

// =============================================================================
// Tests
// =============================================================================
