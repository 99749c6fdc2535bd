//! Per-job QoS reporting: sample collection and report forwarding.
//!
//! Three pieces, in the usual client / daemon / handle split:
//!
//! 1. [`QosReporterClient`] — fire-and-forget sample emission for task-side
//!    reporters.
//! 2. The forwarder daemon — batches samples and announcements, ships one
//!    [`crate::messages::QosReport`] per aggregation tick to the elected
//!    manager.
//! 3. [`ReportForwarder`] — the owning handle: spawns the daemon, carries
//!    the shared [`ReporterSettings`], reconfigures, shuts down.

mod client;
mod forwarder;

pub use client::QosReporterClient;
pub use forwarder::ForwarderEvent;

use crate::config::QosPluginConfig;
use crate::dispatcher::DispatcherClient;
use crate::ids::JobId;
use crate::messages::DeployInstanceQosRolesAction;
use forwarder::ForwarderWorker;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Intervals governing task-side reporting, shared between the environment
/// (which applies per-job config overrides), deploy actions, and the
/// reporters that read them.
#[derive(Debug, Clone, Copy)]
pub struct ReporterSettings {
    /// Milliseconds between report flushes.
    pub aggregation_interval_ms: u64,
    /// One in N records carries a latency tag.
    pub tagging_interval: u32,
}

pub type SharedReporterSettings = Arc<RwLock<ReporterSettings>>;

/// Handle owning a job's forwarder daemon.
pub struct ReportForwarder {
    tx: mpsc::UnboundedSender<ForwarderEvent>,
    settings: SharedReporterSettings,
    shutdown: CancellationToken,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReportForwarder {
    /// Spawns the forwarder daemon for `job` on the given runtime.
    pub fn spawn(
        job: JobId,
        config: &QosPluginConfig,
        dispatcher: DispatcherClient,
        runtime_handle: &tokio::runtime::Handle,
    ) -> Self {
        let settings: SharedReporterSettings = Arc::new(RwLock::new(ReporterSettings {
            aggregation_interval_ms: config.aggregation_interval_ms,
            tagging_interval: config.tagging_interval,
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker = ForwarderWorker::new(job, rx, dispatcher, Arc::clone(&settings));
        let worker_shutdown = shutdown.clone();
        let worker_handle = runtime_handle.spawn(async move {
            worker.run(worker_shutdown).await;
        });

        Self {
            tx,
            settings,
            shutdown,
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    /// Returns a sample-emission client for task-side reporters.
    pub fn client(&self) -> QosReporterClient {
        QosReporterClient::new(self.tx.clone())
    }

    /// Returns the shared settings handle (read by reporters for the
    /// tagging interval).
    pub fn settings(&self) -> SharedReporterSettings {
        Arc::clone(&self.settings)
    }

    /// Applies a deploy-roles action: manager target, reporter configs to
    /// announce, interval overrides.
    pub fn configure(&self, action: DeployInstanceQosRolesAction) {
        let _ = self.tx.send(ForwarderEvent::Configure(Box::new(action)));
    }

    /// Overrides the reporting intervals (per-job configuration).
    pub fn set_intervals(&self, aggregation_interval_ms: Option<u64>, tagging_interval: Option<u32>) {
        let mut settings = self.settings.write().unwrap();
        if let Some(interval) = aggregation_interval_ms {
            settings.aggregation_interval_ms = interval;
        }
        if let Some(interval) = tagging_interval {
            settings.tagging_interval = interval;
        }
    }

    /// Stops the ticker and drains pending samples with a final flush.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for ReportForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportForwarder")
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
