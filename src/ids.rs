//! Opaque identifier types for jobs, graph elements, and workers.
//!
//! All identifiers are fixed-width values minted by the host engine; the QoS
//! subsystem only ever compares, hashes, and forwards them. They are kept as
//! distinct newtypes so a channel id can never be passed where a gate id is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw engine-assigned value.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw value, e.g. for engine-side routing tables.
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:016x}", self.0)
            }
        }
    };
}

define_id! {
    /// Identifies a streaming job across all workers.
    JobId
}

define_id! {
    /// Identifies a logical operator (group vertex) in the job graph.
    GroupVertexId
}

define_id! {
    /// Identifies one parallel task instance (member vertex).
    VertexId
}

define_id! {
    /// Identifies an input or output gate on a member vertex.
    GateId
}

define_id! {
    /// Identifies a channel by its source end; edges are keyed by this.
    ChannelId
}

define_id! {
    /// Identifies a latency constraint declared for a job.
    ConstraintId
}

define_id! {
    /// Identifies a worker process (task manager instance).
    InstanceId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_roundtrip_raw() {
        let id = JobId::from_raw(42);
        assert_eq!(id.as_raw(), 42);
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(GateId::from_raw(0xbeef).to_string(), "000000000000beef");
        assert_eq!(GateId::from_raw(0).to_string().len(), 16);
    }

    #[test]
    fn test_ids_are_hashable_and_distinct() {
        let mut set = HashSet::new();
        set.insert(ChannelId::from_raw(1));
        set.insert(ChannelId::from_raw(2));
        set.insert(ChannelId::from_raw(1));
        assert_eq!(set.len(), 2);
    }
}
