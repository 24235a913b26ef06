//! Fair group and fair queue configuration

use std::time::Duration;

/// Default latency goal bounding the burst the gate may accumulate (1 ms)
pub const DEFAULT_RATE_LIMIT_DURATION_MS: u64 = 1;

/// Default anti-starvation window / fairness decay constant (5 ms)
pub const DEFAULT_TAU_MS: u64 = 5;

/// Default fraction of the device rate the gate admits
pub const DEFAULT_RATE_FACTOR: f32 = 1.0;

/// Default number of shards sharing one gate
pub const DEFAULT_SHARDS: u32 = 1;

/// Default device IOPS estimate
pub const DEFAULT_WEIGHT_RATE: u64 = 100_000;

/// Default device bandwidth estimate (500 MB/s)
pub const DEFAULT_SIZE_RATE: u64 = 500_000_000;

/// Configuration for a shared capacity gate.
///
/// Typically derived from measured device throughput by the runtime that
/// owns the device.
#[derive(Debug, Clone)]
pub struct FairGroupConfig {
    /// Label used in logs and diagnostics
    pub label: String,

    /// Weight of the smallest request the gate will see; together with
    /// `min_size` this sets the replenish grain
    pub min_weight: u32,

    /// Size of the smallest request the gate will see
    pub min_size: u32,

    /// Device operation rate (ops/sec)
    pub weight_rate: u64,

    /// Device data rate (bytes/sec)
    pub size_rate: u64,

    /// Fraction (0, 1] of the device rate the gate admits
    pub rate_factor: f32,

    /// Latency goal; the gate accumulates at most this much burst
    pub rate_limit_duration: Duration,

    /// Number of shards sharing this gate; bounds each shard's per-dispatch
    /// budget
    pub shards: u32,
}

impl Default for FairGroupConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            min_weight: 0,
            min_size: 0,
            weight_rate: DEFAULT_WEIGHT_RATE,
            size_rate: DEFAULT_SIZE_RATE,
            rate_factor: DEFAULT_RATE_FACTOR,
            rate_limit_duration: Duration::from_millis(DEFAULT_RATE_LIMIT_DURATION_MS),
            shards: DEFAULT_SHARDS,
        }
    }
}

impl FairGroupConfig {
    /// Create a config for a device with the given measured rates.
    pub fn new(label: impl Into<String>, weight_rate: u64, size_rate: u64) -> Self {
        Self {
            label: label.into(),
            weight_rate,
            size_rate,
            ..Self::default()
        }
    }

    /// Set the minimal request dimensions (replenish grain).
    pub fn with_min_ticket(mut self, min_weight: u32, min_size: u32) -> Self {
        self.min_weight = min_weight;
        self.min_size = min_size;
        self
    }

    /// Set the admitted fraction of the device rate.
    pub fn with_rate_factor(mut self, factor: f32) -> Self {
        self.rate_factor = factor;
        self
    }

    /// Set the latency goal bounding burst accumulation.
    pub fn with_rate_limit_duration(mut self, duration: Duration) -> Self {
        self.rate_limit_duration = duration;
        self
    }

    /// Set the number of shards sharing the gate.
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards.max(1);
        self
    }
}

/// Configuration for one per-shard fair queue.
#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    /// Label used in logs and diagnostics
    pub label: String,

    /// Fairness window: bounds both the idle-class handicap and the
    /// convergence time of proportional sharing
    pub tau: Duration,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            tau: Duration::from_millis(DEFAULT_TAU_MS),
        }
    }
}

impl FairQueueConfig {
    /// Create a config with the given label and default tau.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Set the fairness window.
    pub fn with_tau(mut self, tau: Duration) -> Self {
        self.tau = tau;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_config_builders() {
        let cfg = FairGroupConfig::new("sda", 10_000, 1_000_000_000)
            .with_min_ticket(1, 512)
            .with_rate_factor(0.5)
            .with_rate_limit_duration(Duration::from_millis(2))
            .with_shards(8);

        assert_eq!(cfg.label, "sda");
        assert_eq!(cfg.weight_rate, 10_000);
        assert_eq!(cfg.size_rate, 1_000_000_000);
        assert_eq!(cfg.min_weight, 1);
        assert_eq!(cfg.min_size, 512);
        assert_eq!(cfg.rate_factor, 0.5);
        assert_eq!(cfg.rate_limit_duration, Duration::from_millis(2));
        assert_eq!(cfg.shards, 8);
    }

    #[test]
    fn test_shards_floor() {
        let cfg = FairGroupConfig::default().with_shards(0);
        assert_eq!(cfg.shards, 1, "shard count must never reach zero");
    }

    #[test]
    fn test_queue_config_defaults() {
        let cfg = FairQueueConfig::new("commitlog");
        assert_eq!(cfg.label, "commitlog");
        assert_eq!(cfg.tau, Duration::from_millis(DEFAULT_TAU_MS));
    }
}
