//! Shared capacity gate
//!
//! A fair group bounds the aggregate dispatch rate of every fair queue
//! attached to one physical device. The limit is a linear combination of
//! IOPS and bandwidth: each request's two-dimensional ticket is normalized
//! against the device's per-tick capacity axis and converted into integer
//! tokens, and the gate is a modified token bucket over those tokens.
//!
//! The bucket is a pair of wrapping monotonic counters (rovers), one
//! chasing the other. Grabbing tokens advances the tail; replenishment and
//! request completion advance the head. A grab whose target overruns the
//! head must wait until the head crosses it, and since shards grab the
//! tail in CAS-linearization order they wake up in that same order, an
//! implicit FIFO across shards with no shared queue.
//!
//! One logical replenisher drives the head from elapsed time. Each shard
//! lazily offers to replenish on its dispatch ticks; a CAS on the
//! replenish timestamp picks a single winner per grace window, so the
//! tokens are minted exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::FairGroupConfig;
use crate::error::ConfigError;
use crate::ticket::Ticket;

/// Scalar capacity unit admitted by the gate.
pub type Capacity = u64;

/// Signed counterpart used for wrap-aware rover comparison.
pub(crate) type SignedCapacity = i64;

/// Fixed-point factor turning normalized (sub-1.0) ticket costs into
/// non-zero integers.
pub const FIXED_POINT_FACTOR: f64 = (1u64 << 24) as f64;

const MILLIS_PER_SEC: u64 = 1_000;

/// One second of replenishment must stay within the rovers'
/// signed-comparison range.
const MAX_RATE: Capacity = Capacity::MAX / 2 / MILLIS_PER_SEC;

/// Convert a duration into rate-resolution ticks (fractional milliseconds).
///
/// Device rates are per-second quantities; scaled down to the millisecond
/// resolution they still fit the 32-bit ticket dimensions after the
/// io-layer multipliers are applied.
pub(crate) fn rate_ticks(delta: Duration) -> f64 {
    delta.as_secs_f64() * MILLIS_PER_SEC as f64
}

/// Process-wide capacity gate shared by all shards dispatching to one
/// device.
///
/// Created once at start-up from the device's measured throughput and kept
/// alive (behind an `Arc`) for as long as any fair queue references it.
#[derive(Debug)]
pub struct FairGroup {
    label: String,
    /// Reference axis: device capacity per rate-resolution tick
    cost_capacity: Ticket,
    /// Tokens minted per tick
    rate: Capacity,
    /// Maximum accumulated tokens; caps burst admission
    limit: Capacity,
    /// Minimum replenishment grain
    threshold: Capacity,
    shards: u32,
    /// Total tokens ever reserved
    tail: AtomicU64,
    /// Total tokens ever made available
    head: AtomicU64,
    /// Construction-time clock origin for the replenish timestamp
    base: Instant,
    /// Nanoseconds since `base` at which the head was last replenished
    replenished_ns: AtomicU64,
}

impl FairGroup {
    /// Build a gate for a device with the given configuration.
    pub fn new(cfg: FairGroupConfig) -> Result<Self, ConfigError> {
        let cost_capacity = Ticket::new(
            (cfg.weight_rate / MILLIS_PER_SEC) as u32,
            (cfg.size_rate / MILLIS_PER_SEC) as u32,
        );
        if !cost_capacity.is_non_zero() {
            return Err(ConfigError::ZeroCostCapacity(cost_capacity));
        }

        let rate = (cfg.rate_factor as f64 * FIXED_POINT_FACTOR).round() as Capacity;
        if rate == 0 || rate > MAX_RATE {
            return Err(ConfigError::RateOutOfRange {
                rate,
                max: MAX_RATE,
            });
        }

        let limit = ((rate as f64 * rate_ticks(cfg.rate_limit_duration)).round() as Capacity).max(1);

        let min_capacity = Self::cost(cost_capacity, Ticket::new(cfg.min_weight, cfg.min_size));
        let threshold = min_capacity.clamp(1, limit);
        if min_capacity > threshold {
            return Err(ConfigError::ThresholdTooLow {
                min_capacity,
                threshold,
            });
        }

        tracing::info!(
            label = %cfg.label,
            cost_capacity = %cost_capacity,
            limit,
            rate,
            rate_factor = cfg.rate_factor,
            threshold,
            shards = cfg.shards.max(1),
            "created fair group"
        );

        Ok(Self {
            label: cfg.label,
            cost_capacity,
            rate,
            limit,
            threshold,
            shards: cfg.shards.max(1),
            tail: AtomicU64::new(0),
            // The bucket starts full
            head: AtomicU64::new(limit),
            base: Instant::now(),
            replenished_ns: AtomicU64::new(0),
        })
    }

    /// The gate's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The normalization axis: device capacity per tick.
    pub fn cost_capacity(&self) -> Ticket {
        self.cost_capacity
    }

    /// Maximum tokens the bucket accumulates (burst cap).
    pub fn maximum_capacity(&self) -> Capacity {
        self.limit
    }

    /// Tokens minted per rate-resolution tick.
    pub fn replenish_rate(&self) -> Capacity {
        self.rate
    }

    /// Minimum replenishment grain.
    pub fn replenish_threshold(&self) -> Capacity {
        self.threshold
    }

    /// Number of shards sharing this gate.
    pub fn shards(&self) -> u32 {
        self.shards
    }

    /// Tokens currently available for reservation.
    pub fn available_capacity(&self) -> Capacity {
        Self::gap(
            self.head.load(Ordering::Acquire),
            self.tail.load(Ordering::Acquire),
        )
    }

    /// Convert a ticket into its scalar token cost along this gate's axis.
    pub fn ticket_capacity(&self, ticket: Ticket) -> Capacity {
        Self::cost(self.cost_capacity, ticket)
    }

    /// Convert an internal token count back into device capacity units
    /// (1.0/s means full utilization).
    pub fn capacity_tokens(cap: Capacity) -> f64 {
        cap as f64 / FIXED_POINT_FACTOR / MILLIS_PER_SEC as f64
    }

    /// Reserve `cap` tokens and return the head target the reservation
    /// waits for. Never blocks; the reservation is satisfied once the head
    /// rover crosses the returned value.
    pub fn grab_capacity(&self, cap: Capacity) -> Capacity {
        assert!(
            cap <= self.limit,
            "capacity grab {cap} exceeds the bucket limit {}",
            self.limit
        );
        self.tail.fetch_add(cap, Ordering::AcqRel).wrapping_add(cap)
    }

    /// Return `cap` tokens to the gate. Called on request completion and by
    /// the replenisher.
    pub fn release_capacity(&self, cap: Capacity) {
        self.head.fetch_add(cap, Ordering::AcqRel);
    }

    /// Mint the tokens earned since the last replenishment, if they reach
    /// the threshold grain. The head never runs past `tail + limit`.
    pub fn replenish(&self, now: Instant) {
        let now_ns = now.saturating_duration_since(self.base).as_nanos() as u64;
        let last_ns = self.replenished_ns.load(Ordering::Acquire);
        if now_ns <= last_ns {
            return;
        }

        let extra = self.accumulated_capacity(Duration::from_nanos(now_ns - last_ns));
        if extra < self.threshold {
            return;
        }

        if self
            .replenished_ns
            .compare_exchange(last_ns, now_ns, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // another shard won this grace window
            return;
        }

        let ceiling = self.tail.load(Ordering::Acquire).wrapping_add(self.limit);
        let room = Self::gap(ceiling, self.head.load(Ordering::Acquire));
        let grant = extra.min(room);
        if grant > 0 {
            self.head.fetch_add(grant, Ordering::AcqRel);
        }
    }

    /// Shard-local lazy replenishment, called on every dispatch attempt.
    ///
    /// `local_ts` is the shard's own view of the last replenish time; the
    /// grace check against it keeps idle shards from hammering the shared
    /// timestamp.
    pub fn maybe_replenish(&self, local_ts: &mut Instant) {
        let now = Instant::now();
        let extra = self.accumulated_capacity(now.saturating_duration_since(*local_ts));
        if extra >= self.threshold {
            *local_ts = now;
            self.replenish(now);
        }
    }

    /// How many tokens the head still owes a reservation targeting `from`;
    /// zero means the reservation is satisfied.
    pub fn capacity_deficiency(&self, from: Capacity) -> Capacity {
        Self::gap(from, self.head.load(Ordering::Acquire))
    }

    /// Estimated wall time to mint `cap` tokens at the configured rate.
    pub fn capacity_duration(&self, cap: Capacity) -> Duration {
        Duration::from_secs_f64(cap as f64 / self.rate as f64 / MILLIS_PER_SEC as f64)
    }

    fn cost(axis: Ticket, ticket: Ticket) -> Capacity {
        (ticket.normalize(axis) as f64 * FIXED_POINT_FACTOR) as Capacity
    }

    fn accumulated_capacity(&self, delta: Duration) -> Capacity {
        (self.rate as f64 * rate_ticks(delta)).round() as Capacity
    }

    /// Wrap-aware `max(ahead - behind, 0)`; rovers are never compared with
    /// raw unsigned ordering.
    fn gap(ahead: Capacity, behind: Capacity) -> Capacity {
        let d = ahead.wrapping_sub(behind) as SignedCapacity;
        if d > 0 {
            d as Capacity
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    // weight axis of 1/tick so a request of weight w costs exactly
    // w * FIXED_POINT_FACTOR tokens
    fn test_group(limit_ms: u64) -> FairGroup {
        let cfg = FairGroupConfig::new("test", 1_000, 1_000)
            .with_min_ticket(1, 0)
            .with_rate_limit_duration(Duration::from_millis(limit_ms));
        FairGroup::new(cfg).unwrap()
    }

    fn unit_cap(group: &FairGroup) -> Capacity {
        group.ticket_capacity(Ticket::new(1, 0))
    }

    #[test]
    fn test_construction_rejects_zero_axis() {
        // 500 ops/s is below one op per millisecond tick
        let cfg = FairGroupConfig::new("slow", 500, 1_000_000);
        assert!(matches!(
            FairGroup::new(cfg),
            Err(ConfigError::ZeroCostCapacity(_))
        ));
    }

    #[test]
    fn test_construction_rejects_huge_rate() {
        let cfg = FairGroupConfig::new("hot", 1_000, 1_000_000).with_rate_factor(f32::MAX);
        assert!(matches!(
            FairGroup::new(cfg),
            Err(ConfigError::RateOutOfRange { .. })
        ));
    }

    #[test]
    fn test_construction_rejects_min_ticket_above_limit() {
        // limit is 1 ms of tokens; a min ticket of 10 weight units costs
        // 10 ms worth
        let cfg = FairGroupConfig::new("tiny", 1_000, 1_000)
            .with_min_ticket(10, 0)
            .with_rate_limit_duration(Duration::from_millis(1));
        assert!(matches!(
            FairGroup::new(cfg),
            Err(ConfigError::ThresholdTooLow { .. })
        ));
    }

    #[test]
    fn test_bucket_starts_full() {
        let group = test_group(10);
        assert_eq!(group.available_capacity(), group.maximum_capacity());
    }

    #[test]
    fn test_grab_release_conservation() {
        let group = test_group(10);
        let unit = unit_cap(&group);
        let initial = group.available_capacity();

        let grabbed = [unit, 2 * unit, 3 * unit];
        for cap in grabbed {
            group.grab_capacity(cap);
        }
        assert_eq!(group.available_capacity(), initial - 6 * unit);

        group.release_capacity(2 * unit);
        group.release_capacity(unit);
        assert_eq!(group.available_capacity(), initial - 3 * unit);

        group.release_capacity(3 * unit);
        assert_eq!(group.available_capacity(), initial);
    }

    #[test]
    fn test_deficiency_tracks_head() {
        let group = test_group(2);
        let unit = unit_cap(&group);

        // 2 ms of burst available; the third unit overruns the head
        let t1 = group.grab_capacity(unit);
        let t2 = group.grab_capacity(unit);
        let t3 = group.grab_capacity(unit);
        assert_eq!(group.capacity_deficiency(t1), 0);
        assert_eq!(group.capacity_deficiency(t2), 0);
        assert_eq!(group.capacity_deficiency(t3), unit);

        group.release_capacity(unit);
        assert_eq!(group.capacity_deficiency(t3), 0);
    }

    #[test]
    fn test_replenish_threshold_and_ceiling() {
        let group = test_group(10);
        let unit = unit_cap(&group);
        let start = Instant::now();

        // Drain half the bucket so there is room to mint into.
        group.grab_capacity(5 * unit);
        let drained = group.available_capacity();

        // Too little elapsed time: below the threshold grain, no-op.
        group.replenish(start + Duration::from_micros(10));
        assert_eq!(group.available_capacity(), drained);

        // 3 ms mints ~3 units.
        group.replenish(start + Duration::from_millis(3));
        let after = group.available_capacity();
        assert!(
            after >= drained + 2 * unit && after <= drained + 4 * unit,
            "expected ~3 units minted, available went {drained} -> {after}"
        );

        // A long sleep cannot overfill the bucket past tail + limit.
        group.replenish(start + Duration::from_secs(60));
        assert_eq!(group.available_capacity(), group.maximum_capacity());
    }

    #[test]
    fn test_replenish_is_monotone_in_time() {
        let group = test_group(10);
        group.grab_capacity(group.maximum_capacity());
        let start = Instant::now();

        group.replenish(start + Duration::from_millis(5));
        let after = group.available_capacity();

        // Replaying an older timestamp mints nothing.
        group.replenish(start + Duration::from_millis(2));
        assert_eq!(group.available_capacity(), after);
    }

    #[test]
    fn test_capacity_duration_estimate() {
        let group = test_group(10);
        let unit = unit_cap(&group);

        // One weight unit per tick takes one tick to mint.
        let d = group.capacity_duration(unit);
        let millis = d.as_secs_f64() * 1e3;
        assert!(
            (millis - 1.0).abs() < 0.01,
            "one unit should take ~1ms, got {millis}ms"
        );
    }

    #[test]
    fn test_capacity_tokens_roundtrip() {
        let group = test_group(10);
        // A ticket matching the full per-second axis normalizes to ~1
        // token per second.
        let cap = group.ticket_capacity(Ticket::new(1_000, 0));
        let tokens = FairGroup::capacity_tokens(cap);
        assert!((tokens - 1.0).abs() < 1e-3, "tokens was {tokens}");
    }

    #[test]
    #[should_panic(expected = "exceeds the bucket limit")]
    fn test_grab_above_limit_is_a_contract_violation() {
        let group = test_group(1);
        group.grab_capacity(group.maximum_capacity() + 1);
    }

    #[test]
    fn test_concurrent_grabs_are_linearized() {
        let group = Arc::new(test_group(1000));
        let unit = unit_cap(&group);
        let initial = group.available_capacity();
        let targets = Arc::new(Mutex::new(Vec::new()));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                let targets = Arc::clone(&targets);
                thread::spawn(move || {
                    let mut local = Vec::with_capacity(100);
                    for _ in 0..100 {
                        local.push(group.grab_capacity(unit));
                    }
                    targets.lock().extend(local);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // Every reservation landed and none overlapped: 800 distinct head
        // targets, and the tail advanced by exactly the grabbed total.
        let mut targets = Arc::try_unwrap(targets).unwrap().into_inner();
        targets.sort_unstable();
        targets.dedup();
        assert_eq!(targets.len(), 800, "head targets must be distinct");
        assert_eq!(group.available_capacity(), initial - 800 * unit);
    }
}
