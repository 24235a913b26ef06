//! Scheduler metrics snapshots
//!
//! Plain value types read off a fair queue for export by whatever metrics
//! sink the embedding runtime uses.

use crate::ticket::Ticket;

/// Per-class consumption counters, in device token units.
///
/// Both counters are monotone; `adjusted_consumption` only moves backwards
/// on the (rare) internal accumulator renormalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassMetrics {
    /// Accumulated device capacity consumed by this class. An increment
    /// rate of 1.0/s indicates full device utilization.
    pub consumption: f64,

    /// Consumption adjusted for class shares and the idle handicap; the
    /// quantity dispatch ordering is based on.
    pub adjusted_consumption: f64,
}

/// Point-in-time snapshot of one fair queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Requests waiting across all classes
    pub requests_queued: u32,
    /// Requests dispatched but not yet reported finished
    pub requests_executing: u32,
    /// Resources (weight, size) waiting across all classes
    pub resources_queued: Ticket,
    /// Resources (weight, size) currently executing
    pub resources_executing: Ticket,
}
