//! Collaborator traits for the host dataflow engine.
//!
//! The QoS subsystem never talks to the network or to task runtimes
//! directly; it goes through these seams. The engine implements them, the
//! plugin consumes them, tests mock them.

use crate::ids::{ChannelId, InstanceId, JobId, VertexId};
use crate::messages::StreamMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure to deliver an outbound message to a peer worker.
///
/// Outbound QoS traffic is advisory; the dispatcher logs these and drops
/// the message.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send to {target} timed out")]
    Timeout { target: InstanceId },

    #[error("send to {target} failed: {reason}")]
    SendFailed { target: InstanceId, reason: String },
}

/// The engine's cross-worker RPC send.
///
/// Implementations are expected to apply their own transport-level timeout;
/// no caller blocks indefinitely on a peer.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, target: InstanceId, message: StreamMessage) -> Result<(), TransportError>;
}

/// The runtime surface of a stream task the subsystem calls back into.
///
/// The actual buffer-size enforcement lives in the engine; this trait only
/// carries the request across.
pub trait StreamTaskEnvironment: Send + Sync {
    fn task_name(&self) -> &str;

    /// Caps the output-buffer size of the given channel.
    fn limit_output_buffer_size(&self, channel: ChannelId, buffer_size_bytes: u32);
}

/// A task as handed to the plugin at registration time.
///
/// Only tasks whose invokable runs in a stream task environment participate
/// in QoS reporting; others return `None` and are ignored.
pub trait RuntimeTask: Send + Sync {
    fn job_id(&self) -> JobId;

    fn vertex_id(&self) -> VertexId;

    fn stream_environment(&self) -> Option<Arc<dyn StreamTaskEnvironment>>;
}
