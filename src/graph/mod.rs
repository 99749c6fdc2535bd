//! The in-memory sparse QoS graph.
//!
//! The graph mirrors a job's operator topology at two levels: *group
//! vertices* (logical operators, delivered group-level by the coordinator)
//! and *member vertices* (their parallel instances, announced incrementally
//! by reporters). Members own gates, gates reference edges, edges reference
//! gates — a structural cycle, so everything lives in arena vectors and
//! cross-references are plain index newtypes rather than owning pointers.
//!
//! The graph itself is a passive data structure; all assembly policy (the
//! EMPTY/SHALLOW/READY state machine, announcement buffering, id side
//! tables) lives in [`crate::manager::model`].

pub mod constraint;
pub mod data;

use crate::ids::{ChannelId, ConstraintId, GateId, GroupVertexId, InstanceId, VertexId};
use constraint::LatencyConstraint;
use data::{EdgeQosData, VertexQosData};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

// =============================================================================
// Arena Indices
// =============================================================================

macro_rules! define_idx {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            fn new(index: usize) -> Self {
                Self(index as u32)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_idx! {
    /// Arena index of a group vertex.
    GroupIdx
}
define_idx! {
    /// Arena index of a member vertex.
    MemberIdx
}
define_idx! {
    /// Arena index of a gate.
    GateIdx
}
define_idx! {
    /// Arena index of an edge.
    EdgeIdx
}

// =============================================================================
// Graph Elements
// =============================================================================

/// How records fan out across a group edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPattern {
    /// Member i connects to member i only.
    Pointwise,
    /// Every source member connects to every target member.
    Bipartite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDirection {
    Input,
    Output,
}

/// A group-level edge between two logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosGroupEdge {
    pub source: GroupIdx,
    pub target: GroupIdx,
    pub pattern: DistributionPattern,
}

/// A logical operator with ordered member slots and group-level edges.
#[derive(Debug)]
pub struct QosGroupVertex {
    pub id: GroupVertexId,
    pub name: String,
    members: Vec<Option<MemberIdx>>,
    forward_edges: Vec<QosGroupEdge>,
    backward_edges: Vec<QosGroupEdge>,
}

impl QosGroupVertex {
    /// Known members in member-index order.
    pub fn members(&self) -> impl Iterator<Item = MemberIdx> + '_ {
        self.members.iter().flatten().copied()
    }

    pub fn member_at(&self, member_index: usize) -> Option<MemberIdx> {
        self.members.get(member_index).copied().flatten()
    }

    pub fn member_count(&self) -> usize {
        self.members.iter().flatten().count()
    }

    pub fn forward_edges(&self) -> &[QosGroupEdge] {
        &self.forward_edges
    }

    pub fn backward_edges(&self) -> &[QosGroupEdge] {
        &self.backward_edges
    }
}

/// One parallel instance of a group vertex.
#[derive(Debug)]
pub struct QosMemberVertex {
    pub id: VertexId,
    pub group: GroupIdx,
    pub member_index: usize,
    /// The worker hosting this instance; runtime actions are addressed here.
    pub instance: InstanceId,
    pub name: String,
    input_gates: Vec<Option<GateIdx>>,
    output_gates: Vec<Option<GateIdx>>,
    pub qos: VertexQosData,
}

impl QosMemberVertex {
    pub fn input_gate(&self, gate_index: usize) -> Option<GateIdx> {
        self.input_gates.get(gate_index).copied().flatten()
    }

    pub fn output_gate(&self, gate_index: usize) -> Option<GateIdx> {
        self.output_gates.get(gate_index).copied().flatten()
    }
}

/// A named port on a member vertex with its attached edges.
#[derive(Debug)]
pub struct QosGate {
    pub id: GateId,
    pub vertex: MemberIdx,
    pub gate_index: usize,
    pub direction: GateDirection,
    edges: Vec<EdgeIdx>,
}

impl QosGate {
    /// Attached edges in gate-local index order.
    pub fn edges(&self) -> &[EdgeIdx] {
        &self.edges
    }
}

/// A directed channel from an output-gate slot to an input-gate slot.
#[derive(Debug)]
pub struct QosEdge {
    pub source_channel: ChannelId,
    pub source_gate: GateIdx,
    pub target_gate: GateIdx,
    pub qos: EdgeQosData,
}

// =============================================================================
// Shallow Fragments
// =============================================================================

/// A group-level graph fragment as delivered by the coordinator inside a
/// manager-role deployment: group vertices without members, group edges,
/// and the constraints to watch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShallowGraphFragment {
    pub group_vertices: Vec<GroupVertexSpec>,
    pub group_edges: Vec<GroupEdgeSpec>,
    pub constraints: Vec<LatencyConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupVertexSpec {
    pub id: GroupVertexId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEdgeSpec {
    pub source: GroupVertexId,
    pub target: GroupVertexId,
    pub pattern: DistributionPattern,
}

// =============================================================================
// The Graph
// =============================================================================

/// Arena-allocated sparse QoS graph plus the job's constraints.
#[derive(Debug, Default)]
pub struct QosGraph {
    groups: Vec<QosGroupVertex>,
    members: Vec<QosMemberVertex>,
    gates: Vec<QosGate>,
    edges: Vec<QosEdge>,
    group_index: HashMap<GroupVertexId, GroupIdx>,
    constraints: Vec<LatencyConstraint>,
    constraint_ids: HashSet<ConstraintId>,
}

impl QosGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // State flags
    // -------------------------------------------------------------------------

    /// True when the graph has no group vertices at all.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// True when at least one group vertex has zero members.
    pub fn is_shallow(&self) -> bool {
        self.groups.iter().any(|g| g.member_count() == 0)
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn group(&self, idx: GroupIdx) -> &QosGroupVertex {
        &self.groups[idx.index()]
    }

    pub fn group_by_id(&self, id: GroupVertexId) -> Option<GroupIdx> {
        self.group_index.get(&id).copied()
    }

    pub fn member(&self, idx: MemberIdx) -> &QosMemberVertex {
        &self.members[idx.index()]
    }

    pub fn member_mut(&mut self, idx: MemberIdx) -> &mut QosMemberVertex {
        &mut self.members[idx.index()]
    }

    pub fn gate(&self, idx: GateIdx) -> &QosGate {
        &self.gates[idx.index()]
    }

    pub fn edge(&self, idx: EdgeIdx) -> &QosEdge {
        &self.edges[idx.index()]
    }

    pub fn edge_mut(&mut self, idx: EdgeIdx) -> &mut QosEdge {
        &mut self.edges[idx.index()]
    }

    pub fn constraints(&self) -> &[LatencyConstraint] {
        &self.constraints
    }

    pub fn member_vertex_count(&self) -> usize {
        self.members.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // -------------------------------------------------------------------------
    // Assembly
    // -------------------------------------------------------------------------

    /// Returns the group vertex for `id`, creating an empty placeholder when
    /// it is unknown. Never downgrades an existing group.
    pub fn ensure_group(&mut self, id: GroupVertexId, name: Option<&str>) -> GroupIdx {
        if let Some(&idx) = self.group_index.get(&id) {
            let group = &mut self.groups[idx.index()];
            if group.name.is_empty() {
                if let Some(name) = name {
                    group.name = name.to_string();
                }
            }
            return idx;
        }
        let idx = GroupIdx::new(self.groups.len());
        self.groups.push(QosGroupVertex {
            id,
            name: name.unwrap_or_default().to_string(),
            members: Vec::new(),
            forward_edges: Vec::new(),
            backward_edges: Vec::new(),
        });
        self.group_index.insert(id, idx);
        idx
    }

    /// Unions a shallow fragment into the graph. Idempotent on already-known
    /// ids; structurally invalid constraints are logged and skipped.
    pub fn merge_fragment(&mut self, fragment: &ShallowGraphFragment) {
        for spec in &fragment.group_vertices {
            self.ensure_group(spec.id, Some(&spec.name));
        }

        for spec in &fragment.group_edges {
            let source = self.ensure_group(spec.source, None);
            let target = self.ensure_group(spec.target, None);
            let group_edge = QosGroupEdge {
                source,
                target,
                pattern: spec.pattern,
            };
            let known = self.groups[source.index()]
                .forward_edges
                .iter()
                .any(|e| e.target == target);
            if !known {
                self.groups[source.index()].forward_edges.push(group_edge);
                self.groups[target.index()].backward_edges.push(group_edge);
            }
        }

        for constraint in &fragment.constraints {
            if self.constraint_ids.contains(&constraint.id) {
                continue;
            }
            if let Err(e) = constraint.validate() {
                warn!(constraint = %constraint.id, error = %e, "skipping invalid latency constraint");
                continue;
            }
            self.constraint_ids.insert(constraint.id);
            self.constraints.push(constraint.clone());
        }
    }

    /// Adds a member vertex at its member-index slot, growing the slot list
    /// as needed. Returns the existing member when the slot is taken.
    pub fn add_member(
        &mut self,
        group: GroupIdx,
        member_index: usize,
        id: VertexId,
        instance: InstanceId,
        name: &str,
    ) -> MemberIdx {
        if let Some(existing) = self.groups[group.index()].member_at(member_index) {
            return existing;
        }
        let idx = MemberIdx::new(self.members.len());
        self.members.push(QosMemberVertex {
            id,
            group,
            member_index,
            instance,
            name: name.to_string(),
            input_gates: Vec::new(),
            output_gates: Vec::new(),
            qos: VertexQosData::new(),
        });
        let slots = &mut self.groups[group.index()].members;
        if slots.len() <= member_index {
            slots.resize(member_index + 1, None);
        }
        slots[member_index] = Some(idx);
        idx
    }

    /// Adds a gate at its slot on a member vertex, creating it when absent.
    pub fn ensure_gate(
        &mut self,
        member: MemberIdx,
        direction: GateDirection,
        gate_index: usize,
        id: GateId,
    ) -> GateIdx {
        let slots = match direction {
            GateDirection::Input => &mut self.members[member.index()].input_gates,
            GateDirection::Output => &mut self.members[member.index()].output_gates,
        };
        if let Some(existing) = slots.get(gate_index).copied().flatten() {
            return existing;
        }
        if slots.len() <= gate_index {
            slots.resize(gate_index + 1, None);
        }
        let idx = GateIdx::new(self.gates.len());
        slots[gate_index] = Some(idx);
        self.gates.push(QosGate {
            id,
            vertex: member,
            gate_index,
            direction,
            edges: Vec::new(),
        });
        idx
    }

    /// Adds an edge and wires it into both endpoint gates' edge lists.
    pub fn add_edge(
        &mut self,
        source_channel: ChannelId,
        source_gate: GateIdx,
        target_gate: GateIdx,
    ) -> EdgeIdx {
        let idx = EdgeIdx::new(self.edges.len());
        self.edges.push(QosEdge {
            source_channel,
            source_gate,
            target_gate,
            qos: EdgeQosData::new(),
        });
        self.gates[source_gate.index()].edges.push(idx);
        self.gates[target_gate.index()].edges.push(idx);
        idx
    }
}

// =============================================================================
// Tests
// =============================================================================
