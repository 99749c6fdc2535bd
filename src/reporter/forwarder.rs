//! The per-job report forwarder daemon.
//!
//! Collects locally produced samples and reporter-config announcements and,
//! on every tick of the aggregation interval, ships one bundled
//! [`QosReport`] to the job's currently elected QoS manager through the
//! dispatcher. Reconfigured at runtime by deploy-roles actions: they set
//! the manager target, the reporter configs to announce, and the intervals.

use super::SharedReporterSettings;
use crate::dispatcher::DispatcherClient;
use crate::ids::{InstanceId, JobId};
use crate::messages::{
    DeployInstanceQosRolesAction, EdgeLatencySample, EdgeReporterConfig, EdgeStatisticsSample,
    QosReport, StreamMessage, VertexLatencySample, VertexReporterConfig,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work arriving at the forwarder: samples from task-side reporters and
/// reconfiguration from deploy-roles actions.
#[derive(Debug)]
pub enum ForwarderEvent {
    VertexLatency(VertexLatencySample),
    EdgeLatency(EdgeLatencySample),
    EdgeStatistics(EdgeStatisticsSample),
    Configure(Box<DeployInstanceQosRolesAction>),
}

pub(crate) struct ForwarderWorker {
    pub(crate) job: JobId,
    pub(crate) rx: mpsc::UnboundedReceiver<ForwarderEvent>,
    pub(crate) dispatcher: DispatcherClient,
    pub(crate) settings: SharedReporterSettings,

    pub(crate) manager: Option<InstanceId>,

    /// Every reporter config this worker has been told to run. Kept so the
    /// full set can be re-announced when the elected manager changes.
    pub(crate) known_vertex_reporters: Vec<VertexReporterConfig>,
    pub(crate) known_edge_reporters: Vec<EdgeReporterConfig>,

    /// Announcements not yet shipped to the current manager.
    pub(crate) pending_vertex_announcements: Vec<VertexReporterConfig>,
    pub(crate) pending_edge_announcements: Vec<EdgeReporterConfig>,

    pub(crate) vertex_latencies: Vec<VertexLatencySample>,
    pub(crate) edge_latencies: Vec<EdgeLatencySample>,
    pub(crate) edge_statistics: Vec<EdgeStatisticsSample>,
}

impl ForwarderWorker {
    pub(crate) fn new(
        job: JobId,
        rx: mpsc::UnboundedReceiver<ForwarderEvent>,
        dispatcher: DispatcherClient,
        settings: SharedReporterSettings,
    ) -> Self {
        Self {
            job,
            rx,
            dispatcher,
            settings,
            manager: None,
            known_vertex_reporters: Vec::new(),
            known_edge_reporters: Vec::new(),
            pending_vertex_announcements: Vec::new(),
            pending_edge_announcements: Vec::new(),
            vertex_latencies: Vec::new(),
            edge_latencies: Vec::new(),
            edge_statistics: Vec::new(),
        }
    }

    fn aggregation_interval_ms(&self) -> u64 {
        self.settings.read().unwrap().aggregation_interval_ms.max(1)
    }

    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        info!(job = %self.job, "QoS report forwarder starting");

        let mut current_interval_ms = self.aggregation_interval_ms();
        let mut ticker = tokio::time::interval(Duration::from_millis(current_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

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

                _ = ticker.tick() => {
                    self.flush();
                }
            }

            // Interval overrides (deploy actions, per-job config) take
            // effect by recreating the ticker.
            let desired_ms = self.aggregation_interval_ms();
            if desired_ms != current_interval_ms {
                debug!(job = %self.job, interval_ms = desired_ms, "aggregation interval changed");
                current_interval_ms = desired_ms;
                ticker = tokio::time::interval(Duration::from_millis(desired_ms));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            }
        }

        // Drain whatever reporters enqueued before the shutdown signal,
        // then flush one final report.
        while let Ok(event) = self.rx.try_recv() {
            self.process_event(event);
        }
        self.flush();
        debug!(job = %self.job, "QoS report forwarder stopped");
    }

    pub(crate) fn process_event(&mut self, event: ForwarderEvent) {
        match event {
            ForwarderEvent::VertexLatency(sample) => self.vertex_latencies.push(sample),
            ForwarderEvent::EdgeLatency(sample) => self.edge_latencies.push(sample),
            ForwarderEvent::EdgeStatistics(sample) => self.edge_statistics.push(sample),
            ForwarderEvent::Configure(action) => self.configure(*action),
        }
    }

    fn configure(&mut self, action: DeployInstanceQosRolesAction) {
        if action.aggregation_interval_ms.is_some() || action.tagging_interval.is_some() {
            let mut settings = self.settings.write().unwrap();
            if let Some(interval) = action.aggregation_interval_ms {
                settings.aggregation_interval_ms = interval;
            }
            if let Some(interval) = action.tagging_interval {
                settings.tagging_interval = interval;
            }
        }

        if let Some(assignment) = &action.manager_assignment {
            if self.manager != Some(assignment.manager_instance) {
                self.manager = Some(assignment.manager_instance);
                // A new manager starts from an empty graph; re-announce
                // everything this worker reports on.
                self.pending_vertex_announcements = self.known_vertex_reporters.clone();
                self.pending_edge_announcements = self.known_edge_reporters.clone();
                debug!(
                    job = %self.job,
                    manager = %assignment.manager_instance,
                    "QoS manager target set"
                );
            }
        }

        for config in action.vertex_reporters {
            if !self.known_vertex_reporters.contains(&config) {
                self.known_vertex_reporters.push(config.clone());
                self.pending_vertex_announcements.push(config);
            }
        }
        for config in action.edge_reporters {
            let known = self
                .known_edge_reporters
                .iter()
                .any(|c| c.source_channel == config.source_channel);
            if !known {
                self.known_edge_reporters.push(config.clone());
                self.pending_edge_announcements.push(config);
            }
        }
    }

    /// Ships one bundled report to the manager, if there is anything to
    /// ship and a manager is known.
    pub(crate) fn flush(&mut self) {
        let Some(manager) = self.manager else {
            // No manager elected yet: announcements wait, samples would
            // grow without bound and are dropped.
            let dropped = self.vertex_latencies.len()
                + self.edge_latencies.len()
                + self.edge_statistics.len();
            if dropped > 0 {
                debug!(job = %self.job, dropped, "no QoS manager target; dropping samples");
                self.vertex_latencies.clear();
                self.edge_latencies.clear();
                self.edge_statistics.clear();
            }
            return;
        };

        let report = QosReport {
            job: self.job,
            vertex_latencies: std::mem::take(&mut self.vertex_latencies),
            edge_latencies: std::mem::take(&mut self.edge_latencies),
            edge_statistics: std::mem::take(&mut self.edge_statistics),
            vertex_announcements: std::mem::take(&mut self.pending_vertex_announcements),
            edge_announcements: std::mem::take(&mut self.pending_edge_announcements),
        };
        if report.is_empty() {
            return;
        }
        self.dispatcher.enqueue(manager, StreamMessage::Report(report));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChannelId, GateId, GroupVertexId, VertexId};
    use crate::messages::{GateSpec, QosManagerAssignment};
    use crate::reporter::ReporterSettings;
    use std::sync::{Arc, RwLock};

    fn settings(aggregation_interval_ms: u64) -> SharedReporterSettings {
        Arc::new(RwLock::new(ReporterSettings {
            aggregation_interval_ms,
            tagging_interval: 7,
        }))
    }

    fn worker() -> (
        ForwarderWorker,
        mpsc::UnboundedSender<ForwarderEvent>,
        mpsc::UnboundedReceiver<crate::dispatcher::OutboundItem>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, outbound) = DispatcherClient::test_pair();
        let worker = ForwarderWorker::new(JobId::from_raw(1), rx, client, settings(1000));
        (worker, tx, outbound)
    }

    fn vertex_reporter(vertex: u64) -> VertexReporterConfig {
        VertexReporterConfig {
            group_vertex: GroupVertexId::from_raw(1),
            vertex: VertexId::from_raw(vertex),
            member_index: 0,
            instance: InstanceId::from_raw(1),
            task_name: format!("task-{vertex}"),
            input_gate: Some(GateSpec {
                index: 0,
                id: GateId::from_raw(vertex * 10),
            }),
            output_gate: Some(GateSpec {
                index: 0,
                id: GateId::from_raw(vertex * 10 + 1),
            }),
        }
    }

    fn deploy(manager: Option<u64>, vertices: Vec<VertexReporterConfig>) -> ForwarderEvent {
        ForwarderEvent::Configure(Box::new(DeployInstanceQosRolesAction {
            job: JobId::from_raw(1),
            manager_assignment: manager.map(|raw| QosManagerAssignment {
                manager_instance: InstanceId::from_raw(raw),
                graph: Default::default(),
            }),
            vertex_reporters: vertices,
            edge_reporters: vec![],
            aggregation_interval_ms: None,
            tagging_interval: None,
        }))
    }

    fn sample(latency_ms: f64) -> ForwarderEvent {
        ForwarderEvent::EdgeLatency(EdgeLatencySample {
            source_channel: ChannelId::from_raw(1),
            timestamp_ms: 100,
            latency_ms,
        })
    }

    #[test]
    fn test_flush_bundles_samples_and_announcements() {
        let (mut worker, _tx, mut outbound) = worker();
        worker.process_event(deploy(Some(9), vec![vertex_reporter(1)]));
        worker.process_event(sample(5.0));
        worker.process_event(sample(6.0));

        worker.flush();

        let item = outbound.try_recv().unwrap();
        assert_eq!(item.target, InstanceId::from_raw(9));
        let StreamMessage::Report(report) = item.message else {
            panic!("expected a report");
        };
        assert_eq!(report.edge_latencies.len(), 2);
        assert_eq!(report.vertex_announcements.len(), 1);

        // A second flush with nothing new ships nothing.
        worker.flush();
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_samples_without_manager_are_dropped() {
        let (mut worker, _tx, mut outbound) = worker();
        worker.process_event(sample(5.0));
        worker.flush();
        assert!(outbound.try_recv().is_err());
        assert!(worker.edge_latencies.is_empty());
    }

    #[test]
    fn test_announcements_wait_for_a_manager() {
        let (mut worker, _tx, mut outbound) = worker();
        worker.process_event(deploy(None, vec![vertex_reporter(1)]));
        worker.flush();
        assert!(outbound.try_recv().is_err());

        worker.process_event(deploy(Some(9), vec![]));
        worker.flush();
        let item = outbound.try_recv().unwrap();
        let StreamMessage::Report(report) = item.message else {
            panic!("expected a report");
        };
        assert_eq!(report.vertex_announcements.len(), 1);
    }

    #[test]
    fn test_manager_change_reannounces_known_reporters() {
        let (mut worker, _tx, mut outbound) = worker();
        worker.process_event(deploy(Some(9), vec![vertex_reporter(1), vertex_reporter(2)]));
        worker.flush();
        let _ = outbound.try_recv().unwrap();

        worker.process_event(deploy(Some(10), vec![]));
        worker.flush();
        let item = outbound.try_recv().unwrap();
        assert_eq!(item.target, InstanceId::from_raw(10));
        let StreamMessage::Report(report) = item.message else {
            panic!("expected a report");
        };
        assert_eq!(report.vertex_announcements.len(), 2);
    }

    #[test]
    fn test_duplicate_reporter_configs_are_announced_once() {
        let (mut worker, _tx, mut outbound) = worker();
        worker.process_event(deploy(Some(9), vec![vertex_reporter(1)]));
        worker.process_event(deploy(Some(9), vec![vertex_reporter(1)]));
        worker.flush();

        let item = outbound.try_recv().unwrap();
        let StreamMessage::Report(report) = item.message else {
            panic!("expected a report");
        };
        assert_eq!(report.vertex_announcements.len(), 1);
    }

    #[test]
    fn test_configure_updates_settings() {
        let (mut worker, _tx, _outbound) = worker();
        worker.process_event(ForwarderEvent::Configure(Box::new(
            DeployInstanceQosRolesAction {
                job: JobId::from_raw(1),
                manager_assignment: None,
                vertex_reporters: vec![],
                edge_reporters: vec![],
                aggregation_interval_ms: Some(250),
                tagging_interval: Some(3),
            },
        )));
        let settings = worker.settings.read().unwrap();
        assert_eq!(settings.aggregation_interval_ms, 250);
        assert_eq!(settings.tagging_interval, 3);
    }

    #[tokio::test]
    async fn test_run_flushes_on_tick_and_final_flush_on_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, mut outbound) = DispatcherClient::test_pair();
        let worker = ForwarderWorker::new(JobId::from_raw(1), rx, client, settings(50));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tx.send(deploy(Some(9), vec![])).unwrap();
        tx.send(sample(5.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let item = outbound.recv().await.unwrap();
        assert!(matches!(item.message, StreamMessage::Report(_)));

        // A sample racing shutdown still goes out with the final flush.
        tx.send(sample(7.0)).unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        let mut final_reports = 0;
        while let Ok(item) = outbound.try_recv() {
            if matches!(item.message, StreamMessage::Report(_)) {
                final_reports += 1;
            }
        }
        assert!(final_reports >= 1);
    }
}
