//! The QoS model: graph assembly state machine plus measurement ingestion.
//!
//! A model assembles its graph from two eventually-consistent sources: the
//! shallow group-level fragments delivered with the manager role, and the
//! vertex/edge reporter announcements piggybacked inside QoS reports from
//! (possibly many) reporters. Announcements may arrive in any order; the
//! ones that cannot be resolved yet wait in a buffer and are retried on
//! every merge or announcement-carrying report.
//!
//! States:
//!
//! - **EMPTY** — the graph has no group vertices.
//! - **SHALLOW** — group vertices exist but at least one has no members.
//! - **READY** — every group vertex has at least one member; samples are
//!   ingested. A merge can move a READY model back to SHALLOW by adding
//!   new, still-memberless groups.
//!
//! All methods run on the manager worker; the model is single-threaded by
//! construction.

use crate::graph::data::ChannelStatsMeasurement;
use crate::graph::{
    DistributionPattern, EdgeIdx, GateDirection, GateIdx, MemberIdx, QosGraph,
    ShallowGraphFragment,
};
use crate::ids::{ChannelId, ConstraintId, GateId, JobId, VertexId};
use crate::manager::violation::{ConstraintLogger, ViolationFinder, ViolationListener};
use crate::messages::{EdgeReporterConfig, QosReport, StreamChainAnnounce, VertexReporterConfig};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error};

/// Assembly progress of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Empty,
    Shallow,
    Ready,
}

/// A chain-announce walk hit a topology precondition failure.
///
/// Advisory: callers log and drop, no edge is marked.
#[derive(Debug, Error)]
#[error("invalid stream chain: {reason}")]
pub struct InvalidChain {
    pub reason: String,
}

impl InvalidChain {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Buffer key for vertex announcements: one reporter per member and gate
/// pair may be pending at a time, and re-delivery is idempotent.
type VertexAnnouncementKey = (VertexId, Option<GateId>, Option<GateId>);

pub struct QosModel {
    job: JobId,
    state: ModelState,
    graph: QosGraph,

    pending_vertices: HashMap<VertexAnnouncementKey, VertexReporterConfig>,
    pending_edges: HashMap<ChannelId, EdgeReporterConfig>,

    gates_by_id: HashMap<GateId, GateIdx>,
    members_by_id: HashMap<VertexId, MemberIdx>,
    edges_by_source_channel: HashMap<ChannelId, EdgeIdx>,

    /// Samples older than this are treated as missing.
    freshness_ms: u64,
    /// Violation-scan cadence; also the constraint-log window.
    adjustment_interval_ms: u64,
    loggers: HashMap<ConstraintId, ConstraintLogger>,
}

impl QosModel {
    pub fn new(job: JobId, freshness_ms: u64, adjustment_interval_ms: u64) -> Self {
        Self {
            job,
            state: ModelState::Empty,
            graph: QosGraph::new(),
            pending_vertices: HashMap::new(),
            pending_edges: HashMap::new(),
            gates_by_id: HashMap::new(),
            members_by_id: HashMap::new(),
            edges_by_source_channel: HashMap::new(),
            freshness_ms,
            adjustment_interval_ms,
            loggers: HashMap::new(),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Ready
    }

    pub fn graph(&self) -> &QosGraph {
        &self.graph
    }

    pub fn member_by_id(&self, id: VertexId) -> Option<MemberIdx> {
        self.members_by_id.get(&id).copied()
    }

    pub fn edge_by_source_channel(&self, channel: ChannelId) -> Option<EdgeIdx> {
        self.edges_by_source_channel.get(&channel).copied()
    }

    /// Announcements still waiting for their dependencies.
    pub fn pending_announcements(&self) -> usize {
        self.pending_vertices.len() + self.pending_edges.len()
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    /// Unions a group-level fragment into the graph and retries the
    /// announcement buffer.
    pub fn merge_shallow(&mut self, fragment: &ShallowGraphFragment) {
        self.graph.merge_fragment(fragment);
        self.try_process_buffered();
    }

    /// Ingests one QoS report according to the current state.
    pub fn process_report(&mut self, report: &QosReport) {
        if report.has_announcements() {
            self.buffer_announcements(report);
        }
        if !self.graph.is_empty() && (report.has_announcements() || self.has_pending()) {
            self.try_process_buffered();
        }
        if self.state == ModelState::Ready {
            self.ingest_samples(report);
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending_vertices.is_empty() || !self.pending_edges.is_empty()
    }

    /// Buffers a report's announcements. The group vertices an announcement
    /// names are registered right away (as empty placeholders), which is
    /// what lets a report alone move the model out of EMPTY.
    fn buffer_announcements(&mut self, report: &QosReport) {
        for cfg in &report.vertex_announcements {
            self.graph.ensure_group(cfg.group_vertex, None);
            let key = (
                cfg.vertex,
                cfg.input_gate.map(|g| g.id),
                cfg.output_gate.map(|g| g.id),
            );
            self.pending_vertices.entry(key).or_insert_with(|| cfg.clone());
        }
        for cfg in &report.edge_announcements {
            self.graph.ensure_group(cfg.source_group, None);
            self.graph.ensure_group(cfg.target_group, None);
            self.pending_edges
                .entry(cfg.source_channel)
                .or_insert_with(|| cfg.clone());
        }
    }

    /// Two resolution sweeps (vertices, then edges), then the state flag is
    /// recomputed from the graph. Re-entrant-safe and idempotent.
    fn try_process_buffered(&mut self) {
        self.process_pending_vertex_announcements();
        self.process_pending_edge_announcements();
        self.refresh_state();
    }

    fn refresh_state(&mut self) {
        self.state = if self.graph.is_empty() {
            ModelState::Empty
        } else if self.graph.is_shallow() {
            ModelState::Shallow
        } else {
            ModelState::Ready
        };
    }

    fn process_pending_vertex_announcements(&mut self) {
        let resolvable: Vec<VertexAnnouncementKey> = self
            .pending_vertices
            .iter()
            .filter(|(_, cfg)| self.graph.group_by_id(cfg.group_vertex).is_some())
            .map(|(key, _)| *key)
            .collect();

        for key in resolvable {
            let Some(cfg) = self.pending_vertices.remove(&key) else {
                continue;
            };
            self.assemble_member(&cfg);
        }
    }

    /// Creates the member vertex and its gates if absent and arms the gate
    /// combination the reporter watches.
    fn assemble_member(&mut self, cfg: &VertexReporterConfig) {
        let Some(group_idx) = self.graph.group_by_id(cfg.group_vertex) else {
            return;
        };

        let member_idx = match self.members_by_id.get(&cfg.vertex) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_member(
                    group_idx,
                    cfg.member_index,
                    cfg.vertex,
                    cfg.instance,
                    &cfg.task_name,
                );
                if self.graph.member(idx).id != cfg.vertex {
                    error!(
                        vertex = %cfg.vertex,
                        group = %cfg.group_vertex,
                        member_index = cfg.member_index,
                        "member slot is taken by a different vertex; dropping announcement"
                    );
                    return;
                }
                self.members_by_id.insert(cfg.vertex, idx);
                idx
            }
        };

        if let Some(gate) = cfg.input_gate {
            let gate_idx =
                self.graph
                    .ensure_gate(member_idx, GateDirection::Input, gate.index, gate.id);
            let actual_id = self.graph.gate(gate_idx).id;
            self.gates_by_id.entry(actual_id).or_insert(gate_idx);
        }
        if let Some(gate) = cfg.output_gate {
            let gate_idx =
                self.graph
                    .ensure_gate(member_idx, GateDirection::Output, gate.index, gate.id);
            let actual_id = self.graph.gate(gate_idx).id;
            self.gates_by_id.entry(actual_id).or_insert(gate_idx);
        }

        if let (Some(input), Some(output)) = (cfg.input_gate, cfg.output_gate) {
            self.graph
                .member_mut(member_idx)
                .qos
                .prepare_gate_combination(input.index, output.index);
        }
    }

    fn process_pending_edge_announcements(&mut self) {
        let resolvable: Vec<ChannelId> = self
            .pending_edges
            .iter()
            .filter(|(_, cfg)| {
                self.gates_by_id.contains_key(&cfg.output_gate.id)
                    && self.gates_by_id.contains_key(&cfg.input_gate.id)
            })
            .map(|(channel, _)| *channel)
            .collect();

        for channel in resolvable {
            let Some(cfg) = self.pending_edges.remove(&channel) else {
                continue;
            };
            self.assemble_edge(&cfg);
        }
    }

    /// Creates the edge, wires it into both gates, and indexes it by source
    /// channel. A contradiction between the announcement and the assembled
    /// gates is a structural invariant breach: logged, edge skipped.
    fn assemble_edge(&mut self, cfg: &EdgeReporterConfig) {
        let (Some(&out_idx), Some(&in_idx)) = (
            self.gates_by_id.get(&cfg.output_gate.id),
            self.gates_by_id.get(&cfg.input_gate.id),
        ) else {
            return;
        };

        let out_gate = self.graph.gate(out_idx);
        let in_gate = self.graph.gate(in_idx);
        let source_group = self.graph.group(self.graph.member(out_gate.vertex).group).id;
        let target_group = self.graph.group(self.graph.member(in_gate.vertex).group).id;

        if out_gate.direction != GateDirection::Output
            || in_gate.direction != GateDirection::Input
            || source_group != cfg.source_group
            || target_group != cfg.target_group
        {
            error!(
                channel = %cfg.source_channel,
                "edge announcement contradicts its endpoint gates; skipping edge"
            );
            return;
        }

        if self.edges_by_source_channel.contains_key(&cfg.source_channel) {
            return;
        }
        let edge_idx = self.graph.add_edge(cfg.source_channel, out_idx, in_idx);
        self.edges_by_source_channel.insert(cfg.source_channel, edge_idx);
        debug!(channel = %cfg.source_channel, "assembled QoS edge");
    }

    // -------------------------------------------------------------------------
    // Sample ingestion (READY only)
    // -------------------------------------------------------------------------

    /// Samples referring to unknown gates or channels are silently dropped;
    /// their announcement will arrive eventually and samples are continuous.
    fn ingest_samples(&mut self, report: &QosReport) {
        for sample in &report.vertex_latencies {
            let (Some(&in_idx), Some(&out_idx)) = (
                self.gates_by_id.get(&sample.input_gate),
                self.gates_by_id.get(&sample.output_gate),
            ) else {
                continue;
            };
            let in_gate = self.graph.gate(in_idx);
            let member_idx = in_gate.vertex;
            let input_gate_index = in_gate.gate_index;
            let output_gate_index = self.graph.gate(out_idx).gate_index;
            self.graph.member_mut(member_idx).qos.record_latency(
                input_gate_index,
                output_gate_index,
                sample.timestamp_ms,
                sample.latency_ms,
            );
        }

        for sample in &report.edge_statistics {
            let Some(&edge_idx) = self.edges_by_source_channel.get(&sample.source_channel) else {
                continue;
            };
            self.graph
                .edge_mut(edge_idx)
                .qos
                .record_statistics(ChannelStatsMeasurement {
                    timestamp_ms: sample.timestamp_ms,
                    throughput_bytes_per_sec: sample.throughput_bytes_per_sec,
                    output_buffer_lifetime_ms: sample.output_buffer_lifetime_ms,
                    records_per_buffer: sample.records_per_buffer,
                    records_per_second: sample.records_per_second,
                });
        }

        for sample in &report.edge_latencies {
            let Some(&edge_idx) = self.edges_by_source_channel.get(&sample.source_channel) else {
                continue;
            };
            self.graph
                .edge_mut(edge_idx)
                .qos
                .record_latency(sample.timestamp_ms, sample.latency_ms);
        }
    }

    // -------------------------------------------------------------------------
    // Chain announcements
    // -------------------------------------------------------------------------

    pub fn process_chain_announce(
        &mut self,
        announce: &StreamChainAnnounce,
    ) -> Result<(), InvalidChain> {
        self.mark_chain(announce.chain_begin, announce.chain_end)
    }

    /// Walks forward along single-output-gate POINTWISE edges from `begin`
    /// to `end`, marking every traversed edge as in-chain. The whole walk is
    /// validated before any edge is marked.
    pub fn mark_chain(&mut self, begin: VertexId, end: VertexId) -> Result<(), InvalidChain> {
        let Some(&start) = self.members_by_id.get(&begin) else {
            return Err(InvalidChain::new(format!("unknown chain begin vertex {begin}")));
        };
        if !self.members_by_id.contains_key(&end) {
            return Err(InvalidChain::new(format!("unknown chain end vertex {end}")));
        }

        let mut current = start;
        let mut to_mark: Vec<EdgeIdx> = Vec::new();
        let mut hops = 0usize;

        while self.graph.member(current).id != end {
            hops += 1;
            if hops > self.graph.member_vertex_count() {
                return Err(InvalidChain::new("chain walk does not reach its end vertex"));
            }

            let member = self.graph.member(current);
            let group = self.graph.group(member.group);
            if group.forward_edges().len() != 1 {
                return Err(InvalidChain::new(format!(
                    "cannot chain task '{}' with {} output gates",
                    member.name,
                    group.forward_edges().len()
                )));
            }
            if group.forward_edges()[0].pattern != DistributionPattern::Pointwise {
                return Err(InvalidChain::new(format!(
                    "cannot chain task '{}' with non-POINTWISE distribution",
                    member.name
                )));
            }
            let Some(out_gate) = member.output_gate(0) else {
                return Err(InvalidChain::new(format!(
                    "task '{}' has no assembled output gate",
                    member.name
                )));
            };
            let Some(&edge_idx) = self.graph.gate(out_gate).edges().first() else {
                return Err(InvalidChain::new(format!(
                    "task '{}' has no assembled forward edge",
                    member.name
                )));
            };
            to_mark.push(edge_idx);
            current = self.graph.gate(self.graph.edge(edge_idx).target_gate).vertex;
        }

        for edge_idx in to_mark {
            self.graph.edge_mut(edge_idx).qos.mark_in_chain();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Violation detection
    // -------------------------------------------------------------------------

    /// Runs the violation finder over every constraint, notifying
    /// `listener` for paths beyond the reporting threshold.
    pub fn find_violations(&mut self, listener: &mut dyn ViolationListener, now_ms: u64) {
        let graph = &self.graph;
        for constraint in graph.constraints() {
            let logger = self
                .loggers
                .entry(constraint.id)
                .or_insert_with(|| ConstraintLogger::new(constraint.id, self.adjustment_interval_ms));
            let mut finder = ViolationFinder::new(graph, constraint, now_ms, self.freshness_ms);
            finder.run(listener, logger);
            logger.flush_window(now_ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
