//! Rolling QoS measurement records attached to graph elements.
//!
//! Each record keeps only the latest observation per signal; new samples
//! overwrite old ones. A record is *active* when its observations are
//! younger than the freshness window (the aggregation interval) — stale
//! data is treated as missing, never as zero.

use std::collections::HashMap;

/// The latest latency observation for a vertex gate combination or an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyMeasurement {
    /// Sample-authoritative Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub latency_ms: f64,
}

/// The latest output-channel statistics observation for an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStatsMeasurement {
    pub timestamp_ms: u64,
    pub throughput_bytes_per_sec: f64,
    pub output_buffer_lifetime_ms: f64,
    pub records_per_buffer: f64,
    pub records_per_second: f64,
}

fn is_fresh(timestamp_ms: u64, now_ms: u64, freshness_ms: u64) -> bool {
    timestamp_ms.saturating_add(freshness_ms) >= now_ms
}

// =============================================================================
// Vertex QoS Data
// =============================================================================

/// Per-member-vertex QoS record.
///
/// An (input gate index, output gate index) combination must be armed via
/// [`prepare_gate_combination`](Self::prepare_gate_combination) before
/// samples for it are accepted; a combination is armed exactly when a
/// reporter has been announced for it.
#[derive(Debug, Default)]
pub struct VertexQosData {
    combinations: HashMap<(usize, usize), Option<LatencyMeasurement>>,
}

impl VertexQosData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a gate combination for incoming samples. Idempotent; never
    /// clears an existing measurement.
    pub fn prepare_gate_combination(&mut self, input_gate_index: usize, output_gate_index: usize) {
        self.combinations
            .entry((input_gate_index, output_gate_index))
            .or_insert(None);
    }

    pub fn is_armed(&self, input_gate_index: usize, output_gate_index: usize) -> bool {
        self.combinations
            .contains_key(&(input_gate_index, output_gate_index))
    }

    /// Records a latency sample. Returns false (sample dropped) when the
    /// combination has not been armed by an announcement.
    pub fn record_latency(
        &mut self,
        input_gate_index: usize,
        output_gate_index: usize,
        timestamp_ms: u64,
        latency_ms: f64,
    ) -> bool {
        match self
            .combinations
            .get_mut(&(input_gate_index, output_gate_index))
        {
            Some(slot) => {
                *slot = Some(LatencyMeasurement {
                    timestamp_ms,
                    latency_ms,
                });
                true
            }
            None => false,
        }
    }

    /// True when the combination is armed and its sample is inside the
    /// freshness window.
    pub fn is_active(
        &self,
        input_gate_index: usize,
        output_gate_index: usize,
        now_ms: u64,
        freshness_ms: u64,
    ) -> bool {
        matches!(
            self.combinations.get(&(input_gate_index, output_gate_index)),
            Some(Some(m)) if is_fresh(m.timestamp_ms, now_ms, freshness_ms)
        )
    }

    pub fn latency_ms(&self, input_gate_index: usize, output_gate_index: usize) -> Option<f64> {
        self.combinations
            .get(&(input_gate_index, output_gate_index))
            .and_then(|slot| slot.map(|m| m.latency_ms))
    }
}

// =============================================================================
// Edge QoS Data
// =============================================================================

/// Per-edge QoS record: latest channel latency, latest output-channel
/// statistics, and whether the edge has been absorbed into a task chain.
#[derive(Debug, Default)]
pub struct EdgeQosData {
    latency: Option<LatencyMeasurement>,
    statistics: Option<ChannelStatsMeasurement>,
    in_chain: bool,
}

impl EdgeQosData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&mut self, timestamp_ms: u64, latency_ms: f64) {
        self.latency = Some(LatencyMeasurement {
            timestamp_ms,
            latency_ms,
        });
    }

    pub fn record_statistics(&mut self, measurement: ChannelStatsMeasurement) {
        self.statistics = Some(measurement);
    }

    /// True when both latency and statistics are present and fresh.
    pub fn is_active(&self, now_ms: u64, freshness_ms: u64) -> bool {
        let latency_fresh = self
            .latency
            .is_some_and(|m| is_fresh(m.timestamp_ms, now_ms, freshness_ms));
        let stats_fresh = self
            .statistics
            .is_some_and(|m| is_fresh(m.timestamp_ms, now_ms, freshness_ms));
        latency_fresh && stats_fresh
    }

    pub fn channel_latency_ms(&self) -> Option<f64> {
        self.latency.map(|m| m.latency_ms)
    }

    pub fn statistics(&self) -> Option<&ChannelStatsMeasurement> {
        self.statistics.as_ref()
    }

    pub fn mark_in_chain(&mut self) {
        self.in_chain = true;
    }

    pub fn is_in_chain(&self) -> bool {
        self.in_chain
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 100_000;
    const WINDOW: u64 = 1000;

    fn stats(timestamp_ms: u64) -> ChannelStatsMeasurement {
        ChannelStatsMeasurement {
            timestamp_ms,
            throughput_bytes_per_sec: 1_000_000.0,
            output_buffer_lifetime_ms: 40.0,
            records_per_buffer: 128.0,
            records_per_second: 5000.0,
        }
    }

    #[test]
    fn test_unarmed_vertex_sample_is_dropped() {
        let mut data = VertexQosData::new();
        assert!(!data.record_latency(0, 0, NOW, 12.0));
        assert!(!data.is_armed(0, 0));
        assert_eq!(data.latency_ms(0, 0), None);
    }

    #[test]
    fn test_armed_combination_accepts_samples() {
        let mut data = VertexQosData::new();
        data.prepare_gate_combination(0, 1);
        assert!(data.is_armed(0, 1));
        assert!(!data.is_active(0, 1, NOW, WINDOW));

        assert!(data.record_latency(0, 1, NOW - 10, 12.5));
        assert!(data.is_active(0, 1, NOW, WINDOW));
        assert_eq!(data.latency_ms(0, 1), Some(12.5));
    }

    #[test]
    fn test_stale_vertex_sample_is_inactive() {
        let mut data = VertexQosData::new();
        data.prepare_gate_combination(0, 0);
        data.record_latency(0, 0, NOW - WINDOW - 1, 5.0);
        assert!(!data.is_active(0, 0, NOW, WINDOW));
        // The value itself is still readable for offline analysis.
        assert_eq!(data.latency_ms(0, 0), Some(5.0));
    }

    #[test]
    fn test_rearming_keeps_measurement() {
        let mut data = VertexQosData::new();
        data.prepare_gate_combination(1, 2);
        data.record_latency(1, 2, NOW, 3.0);
        data.prepare_gate_combination(1, 2);
        assert_eq!(data.latency_ms(1, 2), Some(3.0));
    }

    #[test]
    fn test_new_sample_overwrites_old() {
        let mut data = VertexQosData::new();
        data.prepare_gate_combination(0, 0);
        data.record_latency(0, 0, NOW - 500, 10.0);
        data.record_latency(0, 0, NOW, 20.0);
        assert_eq!(data.latency_ms(0, 0), Some(20.0));
    }

    #[test]
    fn test_edge_needs_both_signals() {
        let mut data = EdgeQosData::new();
        assert!(!data.is_active(NOW, WINDOW));

        data.record_latency(NOW, 50.0);
        assert!(!data.is_active(NOW, WINDOW));

        data.record_statistics(stats(NOW));
        assert!(data.is_active(NOW, WINDOW));
        assert_eq!(data.channel_latency_ms(), Some(50.0));
    }

    #[test]
    fn test_edge_with_stale_statistics_is_inactive() {
        let mut data = EdgeQosData::new();
        data.record_latency(NOW, 50.0);
        data.record_statistics(stats(NOW - WINDOW - 1));
        assert!(!data.is_active(NOW, WINDOW));
    }

    #[test]
    fn test_chain_flag() {
        let mut data = EdgeQosData::new();
        assert!(!data.is_in_chain());
        data.mark_in_chain();
        assert!(data.is_in_chain());
    }
}
