//! Per-task QoS coordination.
//!
//! One coordinator per registered stream task. It wires the task's runtime
//! environment to the job's reporting machinery and applies the runtime
//! actions addressed to the task.

use crate::engine::StreamTaskEnvironment;
use crate::ids::VertexId;
use crate::messages::LimitBufferSizeAction;
use crate::reporter::QosReporterClient;
use std::sync::Arc;
use tracing::debug;

pub struct TaskQosCoordinator {
    vertex: VertexId,
    environment: Arc<dyn StreamTaskEnvironment>,
    reporter: QosReporterClient,
}

impl TaskQosCoordinator {
    pub fn new(
        vertex: VertexId,
        environment: Arc<dyn StreamTaskEnvironment>,
        reporter: QosReporterClient,
    ) -> Self {
        Self {
            vertex,
            environment,
            reporter,
        }
    }

    pub fn vertex_id(&self) -> VertexId {
        self.vertex
    }

    /// The client the task's reporters emit samples through.
    pub fn reporter(&self) -> &QosReporterClient {
        &self.reporter
    }

    /// Applies a buffer-size limit to the addressed channel. Enforcement
    /// happens inside the engine's task runtime.
    pub fn handle_limit_buffer_size(&self, action: &LimitBufferSizeAction) {
        debug!(
            task = self.environment.task_name(),
            channel = %action.source_channel,
            buffer_size_bytes = action.buffer_size_bytes,
            "applying buffer-size limit"
        );
        self.environment
            .limit_output_buffer_size(action.source_channel, action.buffer_size_bytes);
    }

    /// Stops QoS reporting for this task.
    pub fn shutdown_reporting(&self) {
        debug!(task = self.environment.task_name(), vertex = %self.vertex, "stopping QoS reporting");
    }
}

impl std::fmt::Debug for TaskQosCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQosCoordinator")
            .field("vertex", &self.vertex)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChannelId, JobId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTaskEnvironment {
        limits: Mutex<Vec<(ChannelId, u32)>>,
    }

    impl StreamTaskEnvironment for MockTaskEnvironment {
        fn task_name(&self) -> &str {
            "mock-task"
        }

        fn limit_output_buffer_size(&self, channel: ChannelId, buffer_size_bytes: u32) {
            self.limits.lock().unwrap().push((channel, buffer_size_bytes));
        }
    }

    #[test]
    fn test_limit_action_reaches_the_task_environment() {
        let environment = Arc::new(MockTaskEnvironment::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let coordinator = TaskQosCoordinator::new(
            VertexId::from_raw(1),
            environment.clone(),
            QosReporterClient::new(tx),
        );

        coordinator.handle_limit_buffer_size(&LimitBufferSizeAction {
            job: JobId::from_raw(1),
            target_vertex: VertexId::from_raw(1),
            source_channel: ChannelId::from_raw(5),
            buffer_size_bytes: 8192,
        });

        let limits = environment.limits.lock().unwrap();
        assert_eq!(limits.as_slice(), &[(ChannelId::from_raw(5), 8192)]);
    }
}
