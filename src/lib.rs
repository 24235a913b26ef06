//! Hierarchical fair-share I/O scheduling for sharded runtimes
//!
//! `fairq` multiplexes one shared physical resource (typically a block
//! device) across many producers in a thread-per-core process:
//!
//! - Two-dimensional request costs (IOPS weight × byte size) projected onto
//!   scalar capacity tokens
//! - A process-wide lock-free token-bucket gate ([`FairGroup`]) bounding
//!   aggregate throughput as a linear combination of IOPS and bandwidth
//! - Per-shard weighted fair queues ([`FairQueue`]) dividing the admitted
//!   capacity across priority classes in proportion to their shares
//! - Bounded-memory anti-starvation accounting so bursty classes cannot
//!   crowd out long-idle ones
//!
//! The crate contains no submission path and never blocks: when the gate
//! runs dry, [`FairQueue::dispatch_requests`] returns early and
//! [`FairQueue::next_pending_aio`] tells the embedding event loop when to
//! try again.

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod queue;
pub mod ticket;

pub use config::{FairGroupConfig, FairQueueConfig};
pub use error::ConfigError;
pub use group::{Capacity, FairGroup};
pub use metrics::{ClassMetrics, QueueStats};
pub use queue::{ClassId, Entry, EntryId, FairQueue};
pub use ticket::Ticket;
