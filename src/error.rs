//! Scheduler error types

use thiserror::Error;

use crate::ticket::Ticket;

/// Errors raised while constructing a capacity gate.
///
/// These are configuration mistakes, reported once at start-up. All
/// steady-state scheduler operations are infallible: capacity exhaustion is
/// a pending outcome, not an error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configured device rates are too low for the millisecond rate
    /// resolution; the normalization axis would have a zero component.
    #[error("cost capacity axis {0} must be non-zero in both dimensions")]
    ZeroCostCapacity(Ticket),

    /// The requested replenish rate cannot be represented.
    #[error("replenish rate {rate} outside the representable range (max {max})")]
    RateOutOfRange { rate: u64, max: u64 },

    /// A minimal-cost request exceeds the replenish threshold, so the gate
    /// could never admit it.
    #[error("minimal request capacity {min_capacity} exceeds the replenish threshold {threshold}")]
    ThresholdTooLow { min_capacity: u64, threshold: u64 },
}
