//! Time-related utility functions.
//!
//! QoS samples and measurements are stamped with Unix epoch milliseconds so
//! that timestamps survive the wire and the sample's own clock stays
//! authoritative during aggregation.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix time in milliseconds.
///
/// Clocks before the epoch collapse to zero rather than panicking; QoS data
/// is advisory and a nonsensical clock only makes samples look stale.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
