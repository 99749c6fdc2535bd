//! Wire messages exchanged between workers.
//!
//! Every message names its own [`JobId`]; routing is strictly by that field.
//! The serde derives are the serialization contract with the engine's RPC
//! transport — the transport itself is an external collaborator behind
//! [`crate::engine::MessageTransport`].

use crate::graph::ShallowGraphFragment;
use crate::ids::{ChannelId, GateId, GroupVertexId, InstanceId, JobId, VertexId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Measurement Samples
// =============================================================================

/// A processing-latency sample for one gate combination of a member vertex.
///
/// The reporter is identified by its gate pair; the manager resolves the
/// gates by id and uses their indices. Timestamps are the sample's own and
/// authoritative for freshness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VertexLatencySample {
    pub input_gate: GateId,
    pub output_gate: GateId,
    pub timestamp_ms: u64,
    pub latency_ms: f64,
}

/// A channel-latency sample, keyed by the channel's source end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeLatencySample {
    pub source_channel: ChannelId,
    pub timestamp_ms: u64,
    pub latency_ms: f64,
}

/// Output-channel statistics for an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeStatisticsSample {
    pub source_channel: ChannelId,
    pub timestamp_ms: u64,
    pub throughput_bytes_per_sec: f64,
    pub output_buffer_lifetime_ms: f64,
    pub records_per_buffer: f64,
    pub records_per_second: f64,
}

// =============================================================================
// Reporter Announcements
// =============================================================================

/// A gate slot on a member vertex: its index within the vertex plus its
/// stable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub index: usize,
    pub id: GateId,
}

/// Announces a newly activated vertex reporter; carries enough to
/// instantiate the member vertex and its gates in the manager's graph.
///
/// A reporter watching a full gate combination names both gates; reporters
/// on pure sources or sinks name only one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexReporterConfig {
    pub group_vertex: GroupVertexId,
    pub vertex: VertexId,
    pub member_index: usize,
    /// Worker hosting the member; runtime actions are addressed here.
    pub instance: InstanceId,
    pub task_name: String,
    pub input_gate: Option<GateSpec>,
    pub output_gate: Option<GateSpec>,
}

/// Announces a newly activated edge reporter. The endpoint group ids let
/// the manager register placeholder groups even before any vertex
/// announcement arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeReporterConfig {
    pub source_channel: ChannelId,
    pub source_group: GroupVertexId,
    pub output_gate: GateSpec,
    pub target_group: GroupVertexId,
    pub input_gate: GateSpec,
    /// Worker hosting the channel's source end.
    pub instance: InstanceId,
}

// =============================================================================
// Reports
// =============================================================================

/// One aggregated bundle of samples and piggybacked reporter announcements,
/// shipped from a forwarder to the job's elected QoS manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosReport {
    pub job: JobId,
    pub vertex_latencies: Vec<VertexLatencySample>,
    pub edge_latencies: Vec<EdgeLatencySample>,
    pub edge_statistics: Vec<EdgeStatisticsSample>,
    pub vertex_announcements: Vec<VertexReporterConfig>,
    pub edge_announcements: Vec<EdgeReporterConfig>,
}

impl QosReport {
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            ..Self::default()
        }
    }

    pub fn has_announcements(&self) -> bool {
        !self.vertex_announcements.is_empty() || !self.edge_announcements.is_empty()
    }

    pub fn has_samples(&self) -> bool {
        !self.vertex_latencies.is_empty()
            || !self.edge_latencies.is_empty()
            || !self.edge_statistics.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_announcements() && !self.has_samples()
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Elects a worker as QoS manager for a job and hands it the shallow graph
/// and constraints to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosManagerAssignment {
    pub manager_instance: InstanceId,
    pub graph: ShallowGraphFragment,
}

/// Deploys QoS roles onto a worker: which reporters to activate, where the
/// job's manager lives, and optional interval overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployInstanceQosRolesAction {
    pub job: JobId,
    pub manager_assignment: Option<QosManagerAssignment>,
    pub vertex_reporters: Vec<VertexReporterConfig>,
    pub edge_reporters: Vec<EdgeReporterConfig>,
    pub aggregation_interval_ms: Option<u64>,
    pub tagging_interval: Option<u32>,
}

/// Caps the output-buffer size of one channel on the worker hosting its
/// source vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitBufferSizeAction {
    pub job: JobId,
    pub target_vertex: VertexId,
    pub source_channel: ChannelId,
    pub buffer_size_bytes: u32,
}

/// Requests construction of a task chain between two vertices.
///
/// At the task-manager plugin this is a documented no-op: chains only
/// become visible through [`StreamChainAnnounce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructStreamChainAction {
    pub job: JobId,
    pub chain_begin: VertexId,
    pub chain_end: VertexId,
}

/// Announces that the tasks between two vertices now run as one chain, so
/// the manager can mark the traversed edges as chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChainAnnounce {
    pub job: JobId,
    pub chain_begin: VertexId,
    pub chain_end: VertexId,
}

// =============================================================================
// Message Envelope
// =============================================================================

/// All stream messages the plugin consumes or produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamMessage {
    Report(QosReport),
    DeployRoles(DeployInstanceQosRolesAction),
    LimitBufferSize(LimitBufferSizeAction),
    ConstructChain(ConstructStreamChainAction),
    ChainAnnounce(StreamChainAnnounce),
}

impl StreamMessage {
    /// The job this message belongs to; dispatch is strictly by this field.
    pub fn job_id(&self) -> JobId {
        match self {
            StreamMessage::Report(m) => m.job,
            StreamMessage::DeployRoles(m) => m.job,
            StreamMessage::LimitBufferSize(m) => m.job,
            StreamMessage::ConstructChain(m) => m.job,
            StreamMessage::ChainAnnounce(m) => m.job,
        }
    }

    /// Short kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Report(_) => "qos-report",
            StreamMessage::DeployRoles(_) => "deploy-qos-roles",
            StreamMessage::LimitBufferSize(_) => "limit-buffer-size",
            StreamMessage::ConstructChain(_) => "construct-stream-chain",
            StreamMessage::ChainAnnounce(_) => "stream-chain-announce",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
