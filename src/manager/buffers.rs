//! Buffer-size control in response to constraint deviations.
//!
//! When a sequence violates its budget, latency is usually sitting in
//! output buffers that fill too slowly; shrinking them trades throughput
//! for latency. The controller scales each offending channel's buffer so
//! its fill time approaches half the observed channel latency, and lets
//! buffers grow back toward the default when a sequence runs with
//! significant slack.
//!
//! Actions are addressed to the worker hosting the edge's source vertex and
//! delivered through the dispatcher; enforcement is the engine's job.

use crate::dispatcher::DispatcherClient;
use crate::graph::QosGraph;
use crate::ids::{ChannelId, JobId};
use crate::manager::violation::{SequenceMember, ViolationListener};
use crate::messages::{LimitBufferSizeAction, StreamMessage};
use std::collections::HashMap;
use tracing::debug;

/// Engine default output-buffer size; also the growth ceiling.
pub const DEFAULT_BUFFER_SIZE_BYTES: u32 = 32_768;

/// Never shrink a buffer below this.
pub const MIN_BUFFER_SIZE_BYTES: u32 = 200;

#[derive(Debug, Clone, Copy)]
struct ChannelControl {
    buffer_size_bytes: u32,
    last_action_ms: Option<u64>,
}

impl Default for ChannelControl {
    fn default() -> Self {
        Self {
            buffer_size_bytes: DEFAULT_BUFFER_SIZE_BYTES,
            last_action_ms: None,
        }
    }
}

/// Violation listener that emits [`LimitBufferSizeAction`]s.
///
/// Tracks the size it last requested per channel and rate-limits itself to
/// one action per channel per adjustment interval. In-chain edges are left
/// alone; their channel no longer has a buffer of its own.
pub struct BufferSizeManager {
    job: JobId,
    dispatcher: DispatcherClient,
    cooldown_ms: u64,
    now_ms: u64,
    channels: HashMap<ChannelId, ChannelControl>,
}

impl BufferSizeManager {
    pub fn new(job: JobId, dispatcher: DispatcherClient, cooldown_ms: u64) -> Self {
        Self {
            job,
            dispatcher,
            cooldown_ms,
            now_ms: 0,
            channels: HashMap::new(),
        }
    }

    /// Stamps the scan time used for cooldown decisions; call once before
    /// each `find_violations` pass.
    pub fn begin_scan(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }
}

impl ViolationListener for BufferSizeManager {
    fn on_violation(&mut self, graph: &QosGraph, members: &[SequenceMember], excess_ms: f64) {
        for member in members {
            let SequenceMember::Edge(edge_idx) = *member else {
                continue;
            };
            let edge = graph.edge(edge_idx);
            if edge.qos.is_in_chain() {
                continue;
            }
            let Some(stats) = edge.qos.statistics() else {
                continue;
            };
            let Some(latency_ms) = edge.qos.channel_latency_ms() else {
                continue;
            };

            let control = self.channels.entry(edge.source_channel).or_default();
            if let Some(last) = control.last_action_ms {
                if self.now_ms.saturating_sub(last) < self.cooldown_ms {
                    continue;
                }
            }

            let observed_lifetime_ms = stats.output_buffer_lifetime_ms.max(1.0);
            let target_lifetime_ms = (latency_ms / 2.0).max(1.0);
            let scale = (target_lifetime_ms / observed_lifetime_ms).clamp(0.0, 2.0);
            let proposed = (control.buffer_size_bytes as f64 * scale) as u32;

            let new_size = if excess_ms > 0.0 {
                proposed.clamp(MIN_BUFFER_SIZE_BYTES, control.buffer_size_bytes)
            } else {
                proposed.clamp(control.buffer_size_bytes, DEFAULT_BUFFER_SIZE_BYTES)
            };
            if new_size == control.buffer_size_bytes {
                continue;
            }

            let source_member = graph.member(graph.gate(edge.source_gate).vertex);
            let action = LimitBufferSizeAction {
                job: self.job,
                target_vertex: source_member.id,
                source_channel: edge.source_channel,
                buffer_size_bytes: new_size,
            };
            debug!(
                channel = %edge.source_channel,
                from = control.buffer_size_bytes,
                to = new_size,
                excess_ms,
                "adjusting output buffer size"
            );
            control.buffer_size_bytes = new_size;
            control.last_action_ms = Some(self.now_ms);
            self.dispatcher
                .enqueue(source_member.instance, StreamMessage::LimitBufferSize(action));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
