//! The task-manager plugin entry point.
//!
//! Process-wide state: the configuration defaults, the outbound message
//! dispatcher, and one [`StreamJobEnvironment`] per job, created on first
//! use. The plugin is an explicit handle the engine threads through its
//! calls; nothing here is a global singleton.
//!
//! Lifecycle: constructed once at worker start, [`shutdown`] once at worker
//! stop. Initialization failures (bad configuration) are fatal to the
//! plugin, never to the worker; everything after that is advisory.
//!
//! [`shutdown`]: StreamQosPlugin::shutdown

use crate::config::{ConfigError, Configuration, QosPluginConfig};
use crate::dispatcher::MessageDispatcher;
use crate::engine::{MessageTransport, RuntimeTask};
use crate::environment::{RegisterError, StreamJobEnvironment};
use crate::ids::{InstanceId, JobId};
use crate::messages::StreamMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct StreamQosPlugin {
    config: QosPluginConfig,
    local_instance: InstanceId,
    dispatcher: MessageDispatcher,
    environments: DashMap<JobId, Arc<StreamJobEnvironment>>,
    runtime_handle: tokio::runtime::Handle,
    shut_down: AtomicBool,
}

impl StreamQosPlugin {
    /// Initializes the plugin: reads configuration defaults and starts the
    /// dispatcher. A malformed configuration is fatal to the plugin.
    pub fn new(
        configuration: &Configuration,
        local_instance: InstanceId,
        transport: Arc<dyn MessageTransport>,
        runtime_handle: &tokio::runtime::Handle,
    ) -> Result<Self, ConfigError> {
        let config = QosPluginConfig::from_configuration(configuration)?;
        info!(
            tagging_interval = config.tagging_interval,
            aggregation_interval_ms = config.aggregation_interval_ms,
            adjustment_interval_ms = config.adjustment_interval_ms,
            "streaming QoS plugin starting"
        );

        Ok(Self {
            config,
            local_instance,
            dispatcher: MessageDispatcher::new(transport, runtime_handle),
            environments: DashMap::new(),
            runtime_handle: runtime_handle.clone(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QosPluginConfig {
        &self.config
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Registers a task with its job's environment. Tasks without a stream
    /// task environment do not participate and are ignored. Optional
    /// attached plugin data (QoS role deployments piggybacked on task
    /// deployment) is routed as inbound data.
    pub fn register_task(
        &self,
        task: &dyn RuntimeTask,
        job_config: &Configuration,
        plugin_data: Option<StreamMessage>,
    ) -> Result<(), RegisterError> {
        if self.is_shut_down() {
            return Ok(());
        }

        if let Some(task_environment) = task.stream_environment() {
            self.environment(task.job_id())
                .register_task(task.vertex_id(), task_environment, job_config)?;
        }

        if let Some(data) = plugin_data {
            self.send_data(data);
        }
        Ok(())
    }

    /// Unregisters a task from its job's environment.
    pub fn unregister_task(&self, task: &dyn RuntimeTask) {
        if self.is_shut_down() {
            return;
        }
        let environment = self
            .environments
            .get(&task.job_id())
            .map(|entry| Arc::clone(entry.value()));
        match environment {
            Some(environment) => environment.unregister_task(task.vertex_id()),
            None => debug!(job = %task.job_id(), "unregister for unknown job"),
        }
    }

    /// Routes inbound data to the environment named by the message's own
    /// job id, creating the environment on first use.
    pub fn send_data(&self, message: StreamMessage) {
        if self.is_shut_down() {
            debug!(kind = message.kind(), "dropping inbound message after shutdown");
            return;
        }
        self.environment(message.job_id()).handle(message);
    }

    /// The plugin serves no synchronous data requests.
    pub fn request_data(&self, _request: StreamMessage) -> Option<StreamMessage> {
        None
    }

    /// Shuts all job environments down first (their final flushes enqueue
    /// outbound reports), then the dispatcher, which drains its queue.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let environments: Vec<Arc<StreamJobEnvironment>> = self
            .environments
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for environment in environments {
            environment.shutdown().await;
        }
        self.environments.clear();

        self.dispatcher.shutdown().await;
        info!("streaming QoS plugin shut down");
    }

    fn environment(&self, job: JobId) -> Arc<StreamJobEnvironment> {
        let entry = self.environments.entry(job).or_insert_with(|| {
            Arc::new(StreamJobEnvironment::new(
                job,
                self.local_instance,
                self.config.clone(),
                self.dispatcher.client(),
                &self.runtime_handle,
            ))
        });
        Arc::clone(entry.value())
    }
}

impl std::fmt::Debug for StreamQosPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQosPlugin")
            .field("jobs", &self.environments.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AGGREGATION_INTERVAL_KEY;
    use crate::engine::{StreamTaskEnvironment, TransportError};
    use crate::ids::{ChannelId, VertexId};
    use crate::messages::{LimitBufferSizeAction, QosReport};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NullTransport;

    #[async_trait]
    impl MessageTransport for NullTransport {
        async fn send(
            &self,
            _target: InstanceId,
            _message: StreamMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

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

    struct MockTask {
        job: JobId,
        vertex: VertexId,
        environment: Option<Arc<MockTaskEnvironment>>,
    }

    impl RuntimeTask for MockTask {
        fn job_id(&self) -> JobId {
            self.job
        }

        fn vertex_id(&self) -> VertexId {
            self.vertex
        }

        fn stream_environment(&self) -> Option<Arc<dyn StreamTaskEnvironment>> {
            self.environment
                .clone()
                .map(|env| env as Arc<dyn StreamTaskEnvironment>)
        }
    }

    fn stream_task(job: u64, vertex: u64) -> (MockTask, Arc<MockTaskEnvironment>) {
        let environment = Arc::new(MockTaskEnvironment::default());
        (
            MockTask {
                job: JobId::from_raw(job),
                vertex: VertexId::from_raw(vertex),
                environment: Some(environment.clone()),
            },
            environment,
        )
    }

    fn plugin() -> StreamQosPlugin {
        StreamQosPlugin::new(
            &Configuration::new(),
            InstanceId::from_raw(1),
            Arc::new(NullTransport),
            &tokio::runtime::Handle::current(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_bad_configuration_is_fatal_at_init() {
        let mut configuration = Configuration::new();
        configuration.set(AGGREGATION_INTERVAL_KEY, "not-a-number");
        let result = StreamQosPlugin::new(
            &configuration,
            InstanceId::from_raw(1),
            Arc::new(NullTransport),
            &tokio::runtime::Handle::current(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_non_stream_tasks_are_ignored() {
        let plugin = plugin();
        let task = MockTask {
            job: JobId::from_raw(1),
            vertex: VertexId::from_raw(1),
            environment: None,
        };
        plugin
            .register_task(&task, &Configuration::new(), None)
            .unwrap();
        assert_eq!(plugin.environments.len(), 0);
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_creates_one_environment_per_job() {
        let plugin = plugin();
        let (task_a, _) = stream_task(1, 1);
        let (task_b, _) = stream_task(1, 2);
        let (task_c, _) = stream_task(2, 3);

        plugin.register_task(&task_a, &Configuration::new(), None).unwrap();
        plugin.register_task(&task_b, &Configuration::new(), None).unwrap();
        plugin.register_task(&task_c, &Configuration::new(), None).unwrap();
        assert_eq!(plugin.environments.len(), 2);

        // Duplicate vertex registration surfaces to the caller.
        let (duplicate, _) = stream_task(1, 1);
        let err = plugin
            .register_task(&duplicate, &Configuration::new(), None)
            .unwrap_err();
        assert!(matches!(err, RegisterError::AlreadyRegistered(_)));

        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_data_routes_by_job_id() {
        let plugin = plugin();
        let (task, task_environment) = stream_task(7, 1);
        plugin.register_task(&task, &Configuration::new(), None).unwrap();

        plugin.send_data(StreamMessage::LimitBufferSize(LimitBufferSizeAction {
            job: JobId::from_raw(7),
            target_vertex: VertexId::from_raw(1),
            source_channel: ChannelId::from_raw(3),
            buffer_size_bytes: 2048,
        }));
        assert_eq!(
            task_environment.limits.lock().unwrap().as_slice(),
            &[(ChannelId::from_raw(3), 2048)]
        );

        // A report for an unknown job creates its environment on first use.
        plugin.send_data(StreamMessage::Report(QosReport::new(JobId::from_raw(8))));
        assert_eq!(plugin.environments.len(), 2);

        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_plugin_data_attached_at_registration_is_routed() {
        let plugin = plugin();
        let (task, _) = stream_task(1, 1);
        plugin
            .register_task(
                &task,
                &Configuration::new(),
                Some(StreamMessage::Report(QosReport::new(JobId::from_raw(1)))),
            )
            .unwrap();
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_data_returns_none() {
        let plugin = plugin();
        let reply = plugin.request_data(StreamMessage::Report(QosReport::new(JobId::from_raw(1))));
        assert!(reply.is_none());
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let plugin = plugin();
        let (task, _) = stream_task(1, 1);
        plugin.register_task(&task, &Configuration::new(), None).unwrap();

        plugin.shutdown().await;
        plugin.shutdown().await;
        assert_eq!(plugin.environments.len(), 0);

        // Registrations after shutdown are ignored.
        let (late, _) = stream_task(3, 9);
        plugin.register_task(&late, &Configuration::new(), None).unwrap();
        assert_eq!(plugin.environments.len(), 0);
    }
}
