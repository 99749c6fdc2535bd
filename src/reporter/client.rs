//! Sample emission for task-side reporters.
//!
//! The instrumentation that produces latency samples lives inside running
//! tasks and must never block on QoS bookkeeping. [`QosReporterClient`] is
//! its fire-and-forget interface: cheap to clone, backed by the forwarder's
//! channel, silently dropping events once the forwarder is gone.

use super::forwarder::ForwarderEvent;
use crate::ids::{ChannelId, GateId};
use crate::messages::{EdgeLatencySample, EdgeStatisticsSample, VertexLatencySample};
use tokio::sync::mpsc;

/// Client handed to task-side reporters for emitting samples.
#[derive(Clone)]
pub struct QosReporterClient {
    tx: mpsc::UnboundedSender<ForwarderEvent>,
}

impl QosReporterClient {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ForwarderEvent>) -> Self {
        Self { tx }
    }

    #[inline]
    fn send(&self, event: ForwarderEvent) {
        // Ignore send errors; the forwarder may have shut down.
        let _ = self.tx.send(event);
    }

    /// Records a processing-latency sample for one gate combination.
    #[inline]
    pub fn vertex_latency(
        &self,
        input_gate: GateId,
        output_gate: GateId,
        timestamp_ms: u64,
        latency_ms: f64,
    ) {
        self.send(ForwarderEvent::VertexLatency(VertexLatencySample {
            input_gate,
            output_gate,
            timestamp_ms,
            latency_ms,
        }));
    }

    /// Records a channel-latency sample.
    #[inline]
    pub fn edge_latency(&self, source_channel: ChannelId, timestamp_ms: u64, latency_ms: f64) {
        self.send(ForwarderEvent::EdgeLatency(EdgeLatencySample {
            source_channel,
            timestamp_ms,
            latency_ms,
        }));
    }

    /// Records output-channel statistics.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn edge_statistics(
        &self,
        source_channel: ChannelId,
        timestamp_ms: u64,
        throughput_bytes_per_sec: f64,
        output_buffer_lifetime_ms: f64,
        records_per_buffer: f64,
        records_per_second: f64,
    ) {
        self.send(ForwarderEvent::EdgeStatistics(EdgeStatisticsSample {
            source_channel,
            timestamp_ms,
            throughput_bytes_per_sec,
            output_buffer_lifetime_ms,
            records_per_buffer,
            records_per_second,
        }));
    }
}

impl std::fmt::Debug for QosReporterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosReporterClient")
            .field("channel_closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_client() -> (QosReporterClient, mpsc::UnboundedReceiver<ForwarderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QosReporterClient::new(tx), rx)
    }

    #[tokio::test]
    async fn test_client_emits_samples() {
        let (client, mut rx) = create_client();

        client.vertex_latency(GateId::from_raw(1), GateId::from_raw(2), 100, 12.5);
        client.edge_latency(ChannelId::from_raw(3), 100, 4.0);
        client.edge_statistics(ChannelId::from_raw(3), 100, 1000.0, 20.0, 64.0, 2000.0);

        assert!(matches!(
            rx.recv().await,
            Some(ForwarderEvent::VertexLatency(s)) if s.latency_ms == 12.5
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ForwarderEvent::EdgeLatency(s)) if s.source_channel == ChannelId::from_raw(3)
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ForwarderEvent::EdgeStatistics(s)) if s.output_buffer_lifetime_ms == 20.0
        ));
    }

    #[test]
    fn test_client_survives_dropped_forwarder() {
        let (client, rx) = create_client();
        drop(rx);
        client.edge_latency(ChannelId::from_raw(1), 0, 1.0);
    }

    #[test]
    fn test_client_clone() {
        let (client, _rx) = create_client();
        let cloned = client.clone();
        cloned.edge_latency(ChannelId::from_raw(1), 0, 1.0);
        client.edge_latency(ChannelId::from_raw(1), 0, 1.0);
    }
}
