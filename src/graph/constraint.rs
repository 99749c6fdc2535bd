//! Latency constraints and the sequences they bound.
//!
//! A constraint declares a latency budget over a *sequence*: an alternating
//! chain of vertex-steps and edge-steps through the group-level job graph.
//! The violation finder instantiates every concrete member-level path that
//! matches a sequence and compares its summed latency against the budget.

use crate::ids::{ConstraintId, GroupVertexId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of a constraint sequence.
///
/// Vertex-steps pin a gate combination on a group; edge-steps pin the gate
/// slots connecting two groups. Consecutive steps chain: an edge-step's
/// endpoints must match the groups and gate indices of its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceElement {
    Vertex {
        group: GroupVertexId,
        input_gate_index: usize,
        output_gate_index: usize,
    },
    Edge {
        source_group: GroupVertexId,
        output_gate_index: usize,
        target_group: GroupVertexId,
        input_gate_index: usize,
    },
}

impl SequenceElement {
    pub fn is_vertex(&self) -> bool {
        matches!(self, SequenceElement::Vertex { .. })
    }

    /// The group a traversal starts from when this is the first element.
    pub fn start_group(&self) -> GroupVertexId {
        match *self {
            SequenceElement::Vertex { group, .. } => group,
            SequenceElement::Edge { source_group, .. } => source_group,
        }
    }
}

/// Structural problems in a declared constraint.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("constraint sequence is empty")]
    EmptySequence,

    #[error("sequence elements at positions {0} and {1} do not alternate")]
    NotAlternating(usize, usize),

    #[error("edge-step at position {0} does not chain with its neighbouring vertex-steps")]
    BrokenChain(usize),
}

/// A latency budget over a sequence of vertices and edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConstraint {
    pub id: ConstraintId,
    pub sequence: Vec<SequenceElement>,
    /// Maximum tolerated end-to-end latency in milliseconds.
    pub budget_ms: f64,
}

impl LatencyConstraint {
    /// Checks the sequence invariants: non-empty, alternating kinds, and
    /// edge-steps whose endpoints match the adjacent vertex-steps.
    pub fn validate(&self) -> Result<(), ConstraintError> {
        if self.sequence.is_empty() {
            return Err(ConstraintError::EmptySequence);
        }

        for (i, window) in self.sequence.windows(2).enumerate() {
            if window[0].is_vertex() == window[1].is_vertex() {
                return Err(ConstraintError::NotAlternating(i, i + 1));
            }
        }

        for (i, element) in self.sequence.iter().enumerate() {
            let SequenceElement::Edge {
                source_group,
                output_gate_index,
                target_group,
                input_gate_index,
            } = element
            else {
                continue;
            };

            if i > 0 {
                match self.sequence[i - 1] {
                    SequenceElement::Vertex {
                        group,
                        output_gate_index: vertex_out,
                        ..
                    } if group == *source_group && vertex_out == *output_gate_index => {}
                    _ => return Err(ConstraintError::BrokenChain(i)),
                }
            }
            if i + 1 < self.sequence.len() {
                match self.sequence[i + 1] {
                    SequenceElement::Vertex {
                        group,
                        input_gate_index: vertex_in,
                        ..
                    } if group == *target_group && vertex_in == *input_gate_index => {}
                    _ => return Err(ConstraintError::BrokenChain(i)),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(raw: u64) -> GroupVertexId {
        GroupVertexId::from_raw(raw)
    }

    fn vertex_step(g: u64) -> SequenceElement {
        SequenceElement::Vertex {
            group: group(g),
            input_gate_index: 0,
            output_gate_index: 0,
        }
    }

    fn edge_step(from: u64, to: u64) -> SequenceElement {
        SequenceElement::Edge {
            source_group: group(from),
            output_gate_index: 0,
            target_group: group(to),
            input_gate_index: 0,
        }
    }

    fn constraint(sequence: Vec<SequenceElement>) -> LatencyConstraint {
        LatencyConstraint {
            id: ConstraintId::from_raw(1),
            sequence,
            budget_ms: 100.0,
        }
    }

    #[test]
    fn test_valid_vertex_edge_vertex() {
        let c = constraint(vec![vertex_step(1), edge_step(1, 2), vertex_step(2)]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert_eq!(
            constraint(vec![]).validate(),
            Err(ConstraintError::EmptySequence)
        );
    }

    #[test]
    fn test_non_alternating_rejected() {
        let c = constraint(vec![vertex_step(1), vertex_step(2)]);
        assert_eq!(c.validate(), Err(ConstraintError::NotAlternating(0, 1)));
    }

    #[test]
    fn test_broken_chain_rejected() {
        // Edge claims to leave group 3 but follows a vertex-step on group 1.
        let c = constraint(vec![vertex_step(1), edge_step(3, 2), vertex_step(2)]);
        assert_eq!(c.validate(), Err(ConstraintError::BrokenChain(1)));
    }

    #[test]
    fn test_edge_only_sequence_is_valid() {
        let c = constraint(vec![edge_step(1, 2)]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_start_group() {
        assert_eq!(vertex_step(7).start_group(), group(7));
        assert_eq!(edge_step(8, 9).start_group(), group(8));
    }
}
