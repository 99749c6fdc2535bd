//! The per-job QoS environment.
//!
//! One environment per job per worker, owning the job's QoS lifecycle on
//! this worker: the report forwarder (created eagerly at job registration),
//! the QoS manager (created lazily — most workers never play the manager
//! role and the manager is costly), and the per-task coordinators. Inbound
//! stream messages are demultiplexed here.
//!
//! Registration, unregistration, and shutdown serialize on one mutex; the
//! report hot path only touches the lazily initialized manager handle,
//! which is a single atomic load once set.

use crate::config::{
    Configuration, QosPluginConfig, AGGREGATION_INTERVAL_KEY, TAGGING_INTERVAL_KEY,
};
use crate::coordinator::TaskQosCoordinator;
use crate::dispatcher::DispatcherClient;
use crate::engine::StreamTaskEnvironment;
use crate::ids::{InstanceId, JobId, VertexId};
use crate::manager::{ManagerEvent, QosManager};
use crate::messages::StreamMessage;
use crate::reporter::ReportForwarder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Task registration failures surfaced to the engine.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("task {0} is already registered")]
    AlreadyRegistered(VertexId),
}

pub struct StreamJobEnvironment {
    job: JobId,
    local_instance: InstanceId,
    config: QosPluginConfig,
    dispatcher: DispatcherClient,
    runtime_handle: tokio::runtime::Handle,

    forwarder: ReportForwarder,
    manager: OnceLock<QosManager>,
    coordinators: Mutex<HashMap<VertexId, TaskQosCoordinator>>,
    shut_down: AtomicBool,
}

impl StreamJobEnvironment {
    /// Creates the environment and starts its forwarder daemon.
    pub fn new(
        job: JobId,
        local_instance: InstanceId,
        config: QosPluginConfig,
        dispatcher: DispatcherClient,
        runtime_handle: &tokio::runtime::Handle,
    ) -> Self {
        let forwarder = ReportForwarder::spawn(job, &config, dispatcher.clone(), runtime_handle);
        Self {
            job,
            local_instance,
            config,
            dispatcher,
            runtime_handle: runtime_handle.clone(),
            forwarder,
            manager: OnceLock::new(),
            coordinators: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// True once the manager daemon has been instantiated on this worker.
    pub fn has_manager(&self) -> bool {
        self.manager.get().is_some()
    }

    // -------------------------------------------------------------------------
    // Task lifecycle
    // -------------------------------------------------------------------------

    /// Registers a stream task, pulling interval overrides from the job
    /// configuration. Idempotence is by vertex: a second registration for
    /// the same vertex is rejected.
    pub fn register_task(
        &self,
        vertex: VertexId,
        task_environment: Arc<dyn StreamTaskEnvironment>,
        job_config: &Configuration,
    ) -> Result<(), RegisterError> {
        if self.is_shut_down() {
            debug!(job = %self.job, vertex = %vertex, "ignoring registration on shut down environment");
            return Ok(());
        }

        self.apply_job_intervals(job_config);

        let mut coordinators = self.coordinators.lock().unwrap();
        if coordinators.contains_key(&vertex) {
            return Err(RegisterError::AlreadyRegistered(vertex));
        }
        coordinators.insert(
            vertex,
            TaskQosCoordinator::new(vertex, task_environment, self.forwarder.client()),
        );
        debug!(job = %self.job, vertex = %vertex, "registered stream task");
        Ok(())
    }

    fn apply_job_intervals(&self, job_config: &Configuration) {
        let aggregation_interval_ms =
            match job_config.get_or(AGGREGATION_INTERVAL_KEY, self.config.aggregation_interval_ms) {
                Ok(value) => value,
                Err(e) => {
                    warn!(job = %self.job, error = %e, "ignoring invalid job aggregation interval");
                    self.config.aggregation_interval_ms
                }
            };
        let tagging_interval =
            match job_config.get_or(TAGGING_INTERVAL_KEY, self.config.tagging_interval) {
                Ok(value) => value,
                Err(e) => {
                    warn!(job = %self.job, error = %e, "ignoring invalid job tagging interval");
                    self.config.tagging_interval
                }
            };
        self.forwarder
            .set_intervals(Some(aggregation_interval_ms), Some(tagging_interval));
    }

    /// Removes a task's coordinator. When the last coordinator departs the
    /// whole environment shuts down.
    pub fn unregister_task(self: &Arc<Self>, vertex: VertexId) {
        if self.is_shut_down() {
            return;
        }

        let now_empty = {
            let mut coordinators = self.coordinators.lock().unwrap();
            match coordinators.remove(&vertex) {
                Some(coordinator) => coordinator.shutdown_reporting(),
                None => debug!(job = %self.job, vertex = %vertex, "unregister for unknown task"),
            }
            coordinators.is_empty()
        };

        if now_empty {
            let environment = Arc::clone(self);
            self.runtime_handle.spawn(async move {
                environment.shutdown().await;
            });
        }
    }

    // -------------------------------------------------------------------------
    // Message demultiplexing
    // -------------------------------------------------------------------------

    pub fn handle(&self, message: StreamMessage) {
        if self.is_shut_down() {
            debug!(job = %self.job, kind = message.kind(), "dropping message for shut down environment");
            return;
        }

        match message {
            StreamMessage::Report(report) => {
                self.manager().hand_off(ManagerEvent::Report(report));
            }

            StreamMessage::DeployRoles(action) => {
                if let Some(assignment) = &action.manager_assignment {
                    if assignment.manager_instance == self.local_instance {
                        self.manager()
                            .hand_off(ManagerEvent::DeployManagerRole(assignment.graph.clone()));
                    }
                }
                info!(
                    job = %self.job,
                    vertex_reporters = action.vertex_reporters.len(),
                    edge_reporters = action.edge_reporters.len(),
                    manager_role = action.manager_assignment.is_some(),
                    "deployed QoS roles"
                );
                self.forwarder.configure(action);
            }

            StreamMessage::LimitBufferSize(action) => {
                let coordinators = self.coordinators.lock().unwrap();
                match coordinators.get(&action.target_vertex) {
                    Some(coordinator) => coordinator.handle_limit_buffer_size(&action),
                    None => {
                        warn!(
                            job = %self.job,
                            vertex = %action.target_vertex,
                            "dropping buffer-size action for unknown task"
                        );
                    }
                }
            }

            StreamMessage::ChainAnnounce(announce) => {
                self.manager().hand_off(ManagerEvent::ChainAnnounce(announce));
            }

            // Chains only become visible through StreamChainAnnounce; the
            // construct action has no receiver-side effect at the task
            // manager.
            StreamMessage::ConstructChain(action) => {
                debug!(
                    job = %self.job,
                    begin = %action.chain_begin,
                    end = %action.chain_end,
                    "ignoring construct-stream-chain action"
                );
            }
        }
    }

    /// Lazily instantiates the manager daemon. The fast path after
    /// initialization is a single atomic load.
    fn manager(&self) -> &QosManager {
        self.manager.get_or_init(|| {
            QosManager::spawn(
                self.job,
                &self.config,
                self.dispatcher.clone(),
                &self.runtime_handle,
            )
        })
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stops the manager (if any), stops the forwarder (final flush), and
    /// clears all coordinators. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(manager) = self.manager.get() {
            manager.shutdown().await;
        }
        self.forwarder.shutdown().await;

        let coordinators: Vec<TaskQosCoordinator> = {
            let mut map = self.coordinators.lock().unwrap();
            map.drain().map(|(_, coordinator)| coordinator).collect()
        };
        for coordinator in &coordinators {
            coordinator.shutdown_reporting();
        }

        info!(job = %self.job, "QoS job environment shut down");
    }
}

impl std::fmt::Debug for StreamJobEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamJobEnvironment")
            .field("job", &self.job)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
