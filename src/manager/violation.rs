//! Constraint-violation detection.
//!
//! For each latency constraint the finder enumerates every concrete path
//! through the QoS graph that instantiates the constraint's sequence,
//! sums the per-element latencies, and reports paths whose distance from
//! the budget exceeds the reporting threshold — in both directions, so the
//! control layer can tighten on violations and relax on significant slack.

use crate::graph::constraint::{LatencyConstraint, SequenceElement};
use crate::graph::{EdgeIdx, MemberIdx, QosGraph};
use crate::ids::ConstraintId;
use std::collections::HashSet;
use tracing::info;

/// Only act on deviations of more than 5% of the constraint budget.
pub const VIOLATION_REPORT_THRESHOLD: f64 = 0.05;

/// One element of a fully-instantiated constraint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMember {
    Vertex(MemberIdx),
    Edge(EdgeIdx),
}

/// Receives paths whose summed latency deviates from the budget by more
/// than the reporting threshold. `excess_ms` is `sum - budget`: positive
/// for violations, negative for significant slack.
pub trait ViolationListener {
    fn on_violation(&mut self, graph: &QosGraph, members: &[SequenceMember], excess_ms: f64);
}

// =============================================================================
// Constraint Logger
// =============================================================================

/// Per-constraint latency log, windowed by the adjustment interval.
///
/// Every fully-enumerated path is recorded (not only violating ones); once
/// per window the aggregate is emitted through `tracing` for offline
/// analysis.
#[derive(Debug)]
pub struct ConstraintLogger {
    constraint: ConstraintId,
    window_ms: u64,
    last_emit_ms: Option<u64>,
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl ConstraintLogger {
    pub fn new(constraint: ConstraintId, window_ms: u64) -> Self {
        Self {
            constraint,
            window_ms,
            last_emit_ms: None,
            count: 0,
            sum_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: f64::NEG_INFINITY,
        }
    }

    /// Records one fully-enumerated path's total latency.
    pub fn record_sequence(&mut self, total_ms: f64) {
        self.count += 1;
        self.sum_ms += total_ms;
        self.min_ms = self.min_ms.min(total_ms);
        self.max_ms = self.max_ms.max(total_ms);
    }

    /// Emits and resets the window aggregate when the window has elapsed.
    pub fn flush_window(&mut self, now_ms: u64) {
        if self.count == 0 {
            return;
        }
        let due = match self.last_emit_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.window_ms,
        };
        if !due {
            return;
        }

        info!(
            constraint = %self.constraint,
            sequences = self.count,
            mean_ms = self.sum_ms / self.count as f64,
            min_ms = self.min_ms,
            max_ms = self.max_ms,
            "constraint latency window"
        );
        self.last_emit_ms = Some(now_ms);
        self.count = 0;
        self.sum_ms = 0.0;
        self.min_ms = f64::INFINITY;
        self.max_ms = f64::NEG_INFINITY;
    }

    #[cfg(test)]
    pub(crate) fn pending_sequences(&self) -> u64 {
        self.count
    }
}

// =============================================================================
// Violation Finder
// =============================================================================

/// Depth-first enumeration of the concrete paths instantiating one
/// constraint's sequence.
///
/// Members are visited in member-index order, edges in gate-local index
/// order; a step is admissible only while its QoS data is active inside the
/// freshness window. A (vertex, gate-combination) pair is never revisited
/// within one path.
pub struct ViolationFinder<'a> {
    graph: &'a QosGraph,
    constraint: &'a LatencyConstraint,
    now_ms: u64,
    freshness_ms: u64,
    members: Vec<Option<SequenceMember>>,
    latencies: Vec<f64>,
    visited: HashSet<(MemberIdx, usize, usize)>,
}

impl<'a> ViolationFinder<'a> {
    pub fn new(
        graph: &'a QosGraph,
        constraint: &'a LatencyConstraint,
        now_ms: u64,
        freshness_ms: u64,
    ) -> Self {
        let length = constraint.sequence.len();
        Self {
            graph,
            constraint,
            now_ms,
            freshness_ms,
            members: vec![None; length],
            latencies: vec![0.0; length],
            visited: HashSet::new(),
        }
    }

    /// Runs the traversal, recording every full path with `logger` and
    /// notifying `listener` for paths beyond the threshold.
    pub fn run(&mut self, listener: &mut dyn ViolationListener, logger: &mut ConstraintLogger) {
        let Some(first) = self.constraint.sequence.first() else {
            return;
        };
        let Some(start_group) = self.graph.group_by_id(first.start_group()) else {
            // The constraint references groups not merged yet.
            return;
        };

        let start_members: Vec<MemberIdx> = self.graph.group(start_group).members().collect();
        for member in start_members {
            self.descend(0, member, listener, logger);
        }
    }

    fn descend(
        &mut self,
        position: usize,
        current: MemberIdx,
        listener: &mut dyn ViolationListener,
        logger: &mut ConstraintLogger,
    ) {
        let graph = self.graph;
        let length = self.constraint.sequence.len();

        match self.constraint.sequence[position] {
            SequenceElement::Vertex {
                group,
                input_gate_index,
                output_gate_index,
            } => {
                let member = graph.member(current);
                if graph.group(member.group).id != group {
                    return;
                }
                let key = (current, input_gate_index, output_gate_index);
                if self.visited.contains(&key) {
                    return;
                }
                if !member
                    .qos
                    .is_active(input_gate_index, output_gate_index, self.now_ms, self.freshness_ms)
                {
                    return;
                }
                let Some(latency) = member.qos.latency_ms(input_gate_index, output_gate_index)
                else {
                    return;
                };

                self.members[position] = Some(SequenceMember::Vertex(current));
                self.latencies[position] = latency;

                if position + 1 == length {
                    self.complete(listener, logger);
                } else {
                    self.visited.insert(key);
                    self.descend(position + 1, current, listener, logger);
                    self.visited.remove(&key);
                }
            }

            SequenceElement::Edge {
                source_group,
                output_gate_index,
                target_group,
                input_gate_index,
            } => {
                let member = graph.member(current);
                if graph.group(member.group).id != source_group {
                    return;
                }
                let Some(gate_idx) = member.output_gate(output_gate_index) else {
                    return;
                };

                let candidates: Vec<EdgeIdx> = graph.gate(gate_idx).edges().to_vec();
                for edge_idx in candidates {
                    let edge = graph.edge(edge_idx);
                    if edge.source_gate != gate_idx {
                        continue;
                    }
                    let target_gate = graph.gate(edge.target_gate);
                    if target_gate.gate_index != input_gate_index {
                        continue;
                    }
                    let target_member = target_gate.vertex;
                    if graph.group(graph.member(target_member).group).id != target_group {
                        continue;
                    }
                    if !edge.qos.is_active(self.now_ms, self.freshness_ms) {
                        continue;
                    }
                    let Some(latency) = edge.qos.channel_latency_ms() else {
                        continue;
                    };

                    self.members[position] = Some(SequenceMember::Edge(edge_idx));
                    self.latencies[position] = latency;

                    if position + 1 == length {
                        self.complete(listener, logger);
                    } else {
                        self.descend(position + 1, target_member, listener, logger);
                    }
                }
            }
        }
    }

    fn complete(&mut self, listener: &mut dyn ViolationListener, logger: &mut ConstraintLogger) {
        let total_ms: f64 = self.latencies.iter().sum();
        logger.record_sequence(total_ms);

        let budget = self.constraint.budget_ms;
        if budget <= 0.0 {
            return;
        }
        let excess_ms = total_ms - budget;
        if excess_ms.abs() / budget > VIOLATION_REPORT_THRESHOLD {
            let members: Vec<SequenceMember> = self.members.iter().copied().flatten().collect();
            listener.on_violation(self.graph, &members, excess_ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::data::ChannelStatsMeasurement;
    use crate::graph::{DistributionPattern, GateDirection, GroupEdgeSpec, GroupVertexSpec, ShallowGraphFragment};
    use crate::ids::{ChannelId, GateId, GroupVertexId, InstanceId, VertexId};

    const NOW: u64 = 1_000_000;
    const WINDOW: u64 = 1000;

    #[derive(Default)]
    struct Capture {
        violations: Vec<(usize, f64)>,
    }

    impl ViolationListener for Capture {
        fn on_violation(&mut self, _graph: &QosGraph, members: &[SequenceMember], excess_ms: f64) {
            self.violations.push((members.len(), excess_ms));
        }
    }

    fn group_id(raw: u64) -> GroupVertexId {
        GroupVertexId::from_raw(raw)
    }

    fn stats(timestamp_ms: u64) -> ChannelStatsMeasurement {
        ChannelStatsMeasurement {
            timestamp_ms,
            throughput_bytes_per_sec: 500_000.0,
            output_buffer_lifetime_ms: 20.0,
            records_per_buffer: 100.0,
            records_per_second: 4000.0,
        }
    }

    /// Builds G1 -> G2 with one member each, one edge, and the given
    /// latencies (vertex 1, edge, vertex 2).
    fn two_group_graph(v1_ms: f64, edge_ms: f64, v2_ms: f64) -> QosGraph {
        let mut graph = QosGraph::new();
        graph.merge_fragment(&ShallowGraphFragment {
            group_vertices: vec![
                GroupVertexSpec {
                    id: group_id(1),
                    name: "source".into(),
                },
                GroupVertexSpec {
                    id: group_id(2),
                    name: "sink".into(),
                },
            ],
            group_edges: vec![GroupEdgeSpec {
                source: group_id(1),
                target: group_id(2),
                pattern: DistributionPattern::Pointwise,
            }],
            constraints: vec![],
        });

        let g1 = graph.group_by_id(group_id(1)).unwrap();
        let g2 = graph.group_by_id(group_id(2)).unwrap();
        let m1 = graph.add_member(g1, 0, VertexId::from_raw(10), InstanceId::from_raw(1), "source[0]");
        let m2 = graph.add_member(g2, 0, VertexId::from_raw(20), InstanceId::from_raw(2), "sink[0]");

        graph.ensure_gate(m1, GateDirection::Input, 0, GateId::from_raw(101));
        let m1_out = graph.ensure_gate(m1, GateDirection::Output, 0, GateId::from_raw(102));
        let m2_in = graph.ensure_gate(m2, GateDirection::Input, 0, GateId::from_raw(201));
        graph.ensure_gate(m2, GateDirection::Output, 0, GateId::from_raw(202));

        let edge = graph.add_edge(ChannelId::from_raw(1), m1_out, m2_in);

        {
            let member = graph.member_mut(m1);
            member.qos.prepare_gate_combination(0, 0);
            member.qos.record_latency(0, 0, NOW, v1_ms);
        }
        {
            let member = graph.member_mut(m2);
            member.qos.prepare_gate_combination(0, 0);
            member.qos.record_latency(0, 0, NOW, v2_ms);
        }
        {
            let edge = graph.edge_mut(edge);
            edge.qos.record_latency(NOW, edge_ms);
            edge.qos.record_statistics(stats(NOW));
        }

        graph
    }

    fn vertex_edge_vertex_constraint(budget_ms: f64) -> LatencyConstraint {
        LatencyConstraint {
            id: ConstraintId::from_raw(1),
            sequence: vec![
                SequenceElement::Vertex {
                    group: group_id(1),
                    input_gate_index: 0,
                    output_gate_index: 0,
                },
                SequenceElement::Edge {
                    source_group: group_id(1),
                    output_gate_index: 0,
                    target_group: group_id(2),
                    input_gate_index: 0,
                },
                SequenceElement::Vertex {
                    group: group_id(2),
                    input_gate_index: 0,
                    output_gate_index: 0,
                },
            ],
            budget_ms,
        }
    }

    fn run_finder(
        graph: &QosGraph,
        constraint: &LatencyConstraint,
    ) -> (Capture, ConstraintLogger) {
        let mut capture = Capture::default();
        let mut logger = ConstraintLogger::new(constraint.id, 5000);
        let mut finder = ViolationFinder::new(graph, constraint, NOW, WINDOW);
        finder.run(&mut capture, &mut logger);
        (capture, logger)
    }

    #[test]
    fn test_violation_is_reported_with_excess() {
        // 30 + 50 + 25 = 105 against a budget of 80 -> excess +25.
        let graph = two_group_graph(30.0, 50.0, 25.0);
        let constraint = vertex_edge_vertex_constraint(80.0);
        let (capture, logger) = run_finder(&graph, &constraint);

        assert_eq!(capture.violations.len(), 1);
        let (path_len, excess) = capture.violations[0];
        assert_eq!(path_len, 3);
        assert!((excess - 25.0).abs() < 1e-9);
        assert_eq!(logger.pending_sequences(), 1);
    }

    #[test]
    fn test_deviation_within_threshold_is_suppressed() {
        // 30 + 28 + 25 = 83 against 80: 3.75% over, below the 5% threshold.
        let graph = two_group_graph(30.0, 28.0, 25.0);
        let constraint = vertex_edge_vertex_constraint(80.0);
        let (capture, logger) = run_finder(&graph, &constraint);

        assert!(capture.violations.is_empty());
        // The path is still logged for offline analysis.
        assert_eq!(logger.pending_sequences(), 1);
    }

    #[test]
    fn test_significant_slack_is_reported_negative() {
        // 10 + 10 + 10 = 30 against 80 -> excess -50.
        let graph = two_group_graph(10.0, 10.0, 10.0);
        let constraint = vertex_edge_vertex_constraint(80.0);
        let (capture, _) = run_finder(&graph, &constraint);

        assert_eq!(capture.violations.len(), 1);
        assert!((capture.violations[0].1 + 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_edge_prunes_the_path() {
        let mut graph = two_group_graph(30.0, 50.0, 25.0);
        // Overwrite the edge latency with a stale sample.
        let g1 = graph.group_by_id(group_id(1)).unwrap();
        let m1 = graph.group(g1).member_at(0).unwrap();
        let out = graph.member(m1).output_gate(0).unwrap();
        let edge = graph.gate(out).edges()[0];
        graph.edge_mut(edge).qos.record_latency(NOW - WINDOW - 1, 50.0);

        let constraint = vertex_edge_vertex_constraint(80.0);
        let (capture, logger) = run_finder(&graph, &constraint);
        assert!(capture.violations.is_empty());
        assert_eq!(logger.pending_sequences(), 0);
    }

    #[test]
    fn test_inactive_vertex_prunes_the_path() {
        let mut graph = two_group_graph(30.0, 50.0, 25.0);
        let g2 = graph.group_by_id(group_id(2)).unwrap();
        let m2 = graph.group(g2).member_at(0).unwrap();
        graph.member_mut(m2).qos.record_latency(0, 0, NOW - WINDOW - 1, 25.0);

        let constraint = vertex_edge_vertex_constraint(80.0);
        let (capture, _) = run_finder(&graph, &constraint);
        assert!(capture.violations.is_empty());
    }

    #[test]
    fn test_unknown_start_group_is_a_noop() {
        let graph = two_group_graph(30.0, 50.0, 25.0);
        let mut constraint = vertex_edge_vertex_constraint(80.0);
        constraint.sequence[0] = SequenceElement::Vertex {
            group: group_id(99),
            input_gate_index: 0,
            output_gate_index: 0,
        };
        let (capture, logger) = run_finder(&graph, &constraint);
        assert!(capture.violations.is_empty());
        assert_eq!(logger.pending_sequences(), 0);
    }

    #[test]
    fn test_logger_window_emits_and_resets() {
        let mut logger = ConstraintLogger::new(ConstraintId::from_raw(1), 1000);
        logger.record_sequence(10.0);
        logger.record_sequence(20.0);
        assert_eq!(logger.pending_sequences(), 2);

        logger.flush_window(NOW);
        assert_eq!(logger.pending_sequences(), 0);

        // Within the window nothing is emitted, the aggregate keeps growing.
        logger.record_sequence(30.0);
        logger.flush_window(NOW + 10);
        assert_eq!(logger.pending_sequences(), 1);

        logger.flush_window(NOW + 1000);
        assert_eq!(logger.pending_sequences(), 0);
    }
}
