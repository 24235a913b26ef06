//! Per-shard weighted fair queue
//!
//! A fair queue lets multiple producers enqueue cost-tagged requests into
//! priority classes and dispatches them proportionally to the classes'
//! shares, within the throughput bound enforced by the shared
//! [`FairGroup`].
//!
//! Each class keeps a FIFO of entries and a running accumulator of the
//! share-scaled capacity it has consumed. Dispatch always picks the class
//! with the lowest accumulator, so classes that lag behind are served
//! first until balance is restored; a class returning from idle re-enters
//! with a bounded handicap so it can neither be starved by long-running
//! classes nor monopolize the device with stale credit.
//!
//! All methods of one queue run on its owning shard; only the group is
//! shared between threads.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::config::FairQueueConfig;
use crate::group::{rate_ticks, Capacity, FairGroup, SignedCapacity, FIXED_POINT_FACTOR};
use crate::metrics::{ClassMetrics, QueueStats};
use crate::ticket::Ticket;

/// Dense identifier of a priority class within one fair queue.
pub type ClassId = usize;

/// A request waiting in (or passing through) a fair queue.
///
/// The scheduler only interprets the ticket; the payload is handed back
/// untouched through the dispatch callback.
#[derive(Debug)]
pub struct Entry<T> {
    ticket: Ticket,
    payload: T,
}

impl<T> Entry<T> {
    /// Create an entry costing `ticket`, carrying `payload`.
    pub fn new(ticket: Ticket, payload: T) -> Self {
        Self { ticket, payload }
    }

    /// The cost of this request.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// The caller-owned payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the entry, returning the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Handle identifying a queued entry, used to cancel it before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId {
    class: ClassId,
    seq: u64,
}

struct QueuedEntry<T> {
    seq: u64,
    entry: Entry<T>,
}

struct PriorityClass<T> {
    shares: u32,
    /// Running share-scaled cost; the heap key. Signed: the idle handicap
    /// can push it below zero right after start-up.
    accumulated: SignedCapacity,
    /// Raw capacity consumed, for metrics
    pure_accumulated: Capacity,
    queue: VecDeque<QueuedEntry<T>>,
    queued: bool,
    plugged: bool,
}

impl<T> PriorityClass<T> {
    fn new(shares: u32) -> Self {
        Self {
            shares: shares.max(1),
            accumulated: 0,
            pure_accumulated: 0,
            queue: VecDeque::new(),
            queued: false,
            plugged: true,
        }
    }

    fn update_shares(&mut self, shares: u32) {
        self.shares = shares.max(1);
    }
}

/// Heap handle; `BinaryHeap` is a max-heap, so ordering is reversed to pop
/// the lowest accumulator first. Ties break by class id.
#[derive(Debug, PartialEq, Eq)]
struct ClassHandle {
    accumulated: SignedCapacity,
    id: ClassId,
}

impl Ord for ClassHandle {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .accumulated
            .cmp(&self.accumulated)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ClassHandle {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Dispatch is blocked until the group's head rover crosses `head`; `cap`
/// tokens are already charged against the group.
struct Pending {
    head: Capacity,
    cap: Capacity,
}

enum GrabResult {
    Grabbed,
    Pending,
    CantPreempt,
}

/// Per-shard fair queue over a shared capacity gate.
pub struct FairQueue<T> {
    config: FairQueueConfig,
    group: Arc<FairGroup>,
    /// Shard-local view of the group's replenish time
    group_replenish: Instant,
    resources_executing: Ticket,
    resources_queued: Ticket,
    requests_executing: u32,
    requests_queued: u32,
    handles: BinaryHeap<ClassHandle>,
    classes: Vec<Option<PriorityClass<T>>>,
    /// Highest accumulator ever dispatched; the baseline for the idle
    /// handicap
    last_accumulated: SignedCapacity,
    pending: Option<Pending>,
    next_seq: u64,
}

impl<T> FairQueue<T> {
    /// Create a fair queue attached to `group`.
    pub fn new(group: Arc<FairGroup>, config: FairQueueConfig) -> Self {
        tracing::debug!(
            label = %config.label,
            group = %group.label(),
            tau_us = config.tau.as_micros() as u64,
            "created fair queue"
        );
        Self {
            config,
            group,
            group_replenish: Instant::now(),
            resources_executing: Ticket::default(),
            resources_queued: Ticket::default(),
            requests_executing: 0,
            requests_queued: 0,
            handles: BinaryHeap::new(),
            classes: Vec::new(),
            last_accumulated: 0,
            pending: None,
            next_seq: 0,
        }
    }

    /// The queue's label.
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Install a priority class at `id` with the given shares (floored at
    /// one). The id space is dense; the class table grows as needed.
    /// Registering an occupied id is a contract violation.
    pub fn register_priority_class(&mut self, id: ClassId, shares: u32) {
        if id >= self.classes.len() {
            self.classes.resize_with(id + 1, || None);
        }
        assert!(
            self.classes[id].is_none(),
            "priority class {id} is already registered"
        );
        self.classes[id] = Some(PriorityClass::new(shares));
        tracing::debug!(label = %self.config.label, class = id, shares, "registered priority class");
    }

    /// Remove the class at `id`. Unregistering a class that still has
    /// queued requests is a contract violation.
    pub fn unregister_priority_class(&mut self, id: ClassId) {
        let class = self.class(id);
        assert!(
            class.queue.is_empty(),
            "priority class {id} still has queued requests"
        );
        if class.queued {
            // still in the heap from a lazy-cleanup window; purge the handle
            self.handles.retain(|h| h.id != id);
        }
        self.classes[id] = None;
        tracing::debug!(label = %self.config.label, class = id, "unregistered priority class");
    }

    /// Change the shares of class `id`; takes effect on the next dispatch.
    pub fn update_shares_for_class(&mut self, id: ClassId, shares: u32) {
        self.class_mut(id).update_shares(shares);
    }

    /// Re-admit class `id` to dispatching. Entries queued while unplugged
    /// become eligible again.
    pub fn plug_class(&mut self, id: ClassId) {
        let class = self.class_mut(id);
        assert!(!class.plugged, "priority class {id} is already plugged");
        class.plugged = true;
        if !class.queue.is_empty() {
            self.push_priority_class_from_idle(id);
        }
    }

    /// Exclude class `id` from dispatching without destroying it.
    pub fn unplug_class(&mut self, id: ClassId) {
        let class = self.class_mut(id);
        assert!(class.plugged, "priority class {id} is already unplugged");
        if class.queued {
            class.queued = false;
            self.handles.retain(|h| h.id != id);
        }
        self.class_mut(id).plugged = false;
    }

    /// Enqueue `entry` into class `id` and return a handle that can cancel
    /// it while it is still queued.
    ///
    /// The caller must invoke [`notify_request_finished`] with the entry's
    /// ticket once the dispatched request completes, success or failure.
    ///
    /// [`notify_request_finished`]: FairQueue::notify_request_finished
    pub fn queue(&mut self, id: ClassId, entry: Entry<T>) -> EntryId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let ticket = entry.ticket;

        if self.class(id).plugged {
            self.push_priority_class_from_idle(id);
        }
        self.class_mut(id).queue.push_back(QueuedEntry { seq, entry });
        self.resources_queued += ticket;
        self.requests_queued += 1;
        EntryId { class: id, seq }
    }

    /// Withdraw a still-queued entry. The entry's cost is dropped
    /// immediately; the entry itself is discarded when dispatch reaches it,
    /// without invoking the callback or touching the gate. Cancelling an
    /// entry that was already dispatched is a contract violation.
    pub fn notify_request_cancelled(&mut self, id: EntryId) {
        let class = self.class_mut(id.class);
        let slot = class
            .queue
            .binary_search_by_key(&id.seq, |qe| qe.seq)
            .unwrap_or_else(|_| panic!("cancelled entry {id:?} is not queued"));
        let ticket = std::mem::take(&mut class.queue[slot].entry.ticket);
        self.resources_queued -= ticket;
    }

    /// Account the completion of a dispatched request and return its
    /// capacity to the gate.
    pub fn notify_request_finished(&mut self, ticket: Ticket) {
        self.resources_executing -= ticket;
        self.requests_executing -= 1;
        self.group.release_capacity(self.group.ticket_capacity(ticket));
    }

    /// Dispatch queued requests through `cb` while the heap has work, the
    /// gate has capacity, and this shard's dispatch budget lasts.
    ///
    /// Returns early with a recorded pending-wait when the gate runs dry;
    /// the next call resumes where it stopped. `cb` receives ownership of
    /// each dispatched entry.
    pub fn dispatch_requests(&mut self, mut cb: impl FnMut(Entry<T>)) {
        self.group.maybe_replenish(&mut self.group_replenish);

        let quota = (self.group.maximum_capacity() / self.group.shards() as u64).max(1);
        let mut dispatched: Capacity = 0;
        let mut preempt: Vec<ClassId> = Vec::new();

        while dispatched < quota {
            let Some(top) = self.handles.peek() else { break };
            let id = top.id;

            let front = self.classes[id]
                .as_ref()
                .unwrap()
                .queue
                .front()
                .map(|qe| qe.entry.ticket);
            let ticket = match front {
                None => {
                    // lazy cleanup of a drained class
                    self.pop_priority_class(id);
                    continue;
                }
                Some(t) if t.is_empty() => {
                    // cancelled while queued; discard without touching the gate
                    self.classes[id].as_mut().unwrap().queue.pop_front();
                    self.requests_queued -= 1;
                    continue;
                }
                Some(t) => t,
            };

            match self.grab_capacity(ticket) {
                GrabResult::Pending => break,
                GrabResult::CantPreempt => {
                    // This class wants more than the standing reservation;
                    // set it aside for this round so the reserving class
                    // can go first.
                    self.pop_priority_class(id);
                    preempt.push(id);
                    continue;
                }
                GrabResult::Grabbed => {}
            }

            let cap = self.group.ticket_capacity(ticket);
            self.last_accumulated = self
                .last_accumulated
                .max(self.classes[id].as_ref().unwrap().accumulated);
            self.pop_priority_class(id);
            let qe = self.classes[id].as_mut().unwrap().queue.pop_front().unwrap();

            self.resources_executing += ticket;
            self.resources_queued -= ticket;
            self.requests_executing += 1;
            self.requests_queued -= 1;

            // Request costs are usually tens of thousands of tokens, but an
            // unrestricted queue can produce ones small enough that dividing
            // by large shares truncates to zero, and a zero-cost class would
            // never yield the heap top. Floor the cost at one token.
            let shares = self.classes[id].as_ref().unwrap().shares;
            let req_cost = ((cap / shares as u64).max(1)) as SignedCapacity;
            if self.classes[id].as_ref().unwrap().accumulated >= SignedCapacity::MAX - req_cost {
                self.renormalize(id);
            }
            let class = self.classes[id].as_mut().unwrap();
            class.accumulated += req_cost;
            class.pure_accumulated += cap;

            dispatched += cap;
            cb(qe.entry);

            let class = self.classes[id].as_ref().unwrap();
            if class.plugged && !class.queue.is_empty() {
                self.push_priority_class(id);
            }
        }

        for id in preempt {
            self.push_priority_class(id);
        }
    }

    /// When dispatch is blocked on the gate, the time by which the missing
    /// tokens will have been minted at the configured rate; `None` when
    /// nothing is pending.
    ///
    /// This is an upper bound for arming a wake-up timer: if capacity is
    /// released earlier by completing requests, the next dispatch tick
    /// proceeds earlier anyway.
    pub fn next_pending_aio(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| {
            let over = self.group.capacity_deficiency(p.head);
            Instant::now() + self.group.capacity_duration(over)
        })
    }

    /// Resources (weight, size) currently queued across all classes.
    pub fn resources_currently_waiting(&self) -> Ticket {
        self.resources_queued
    }

    /// Resources (weight, size) currently executing.
    pub fn resources_currently_executing(&self) -> Ticket {
        self.resources_executing
    }

    /// Number of requests currently queued across all classes.
    pub fn requests_currently_queued(&self) -> u32 {
        self.requests_queued
    }

    /// Number of requests currently executing.
    pub fn requests_currently_executing(&self) -> u32 {
        self.requests_executing
    }

    /// Point-in-time counters for this queue.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            requests_queued: self.requests_queued,
            requests_executing: self.requests_executing,
            resources_queued: self.resources_queued,
            resources_executing: self.resources_executing,
        }
    }

    /// Consumption counters for class `id`, in device token units.
    pub fn class_metrics(&self, id: ClassId) -> ClassMetrics {
        let class = self.class(id);
        ClassMetrics {
            consumption: FairGroup::capacity_tokens(class.pure_accumulated),
            adjusted_consumption: FairGroup::capacity_tokens(class.accumulated.max(0) as Capacity),
        }
    }

    fn class(&self, id: ClassId) -> &PriorityClass<T> {
        self.classes
            .get(id)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("priority class {id} is not registered"))
    }

    fn class_mut(&mut self, id: ClassId) -> &mut PriorityClass<T> {
        self.classes
            .get_mut(id)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("priority class {id} is not registered"))
    }

    fn push_priority_class(&mut self, id: ClassId) {
        let class = self.classes[id].as_mut().unwrap();
        debug_assert!(class.plugged && !class.queued);
        class.queued = true;
        let accumulated = class.accumulated;
        self.handles.push(ClassHandle { accumulated, id });
    }

    /// Re-admit a class that was absent from the heap. The newcomer's
    /// accumulator is pulled up to at most one tau's worth of capacity
    /// (at its share level) behind the last dispatched accumulator, so an
    /// idle period earns bounded credit instead of unbounded credit.
    fn push_priority_class_from_idle(&mut self, id: ClassId) {
        let last = self.last_accumulated;
        let tau_ticks = rate_ticks(self.config.tau);
        let class = self.classes[id].as_mut().unwrap();
        if class.queued {
            return;
        }
        let handicap =
            (FIXED_POINT_FACTOR / class.shares as f64 * tau_ticks) as SignedCapacity;
        // Signed arithmetic: the difference goes negative right after
        // start-up, when nothing has been dispatched yet.
        class.accumulated = class.accumulated.max(last - handicap);
        class.queued = true;
        let accumulated = class.accumulated;
        self.handles.push(ClassHandle { accumulated, id });
    }

    /// Remove the heap-top class (which must be `id`) from the heap.
    fn pop_priority_class(&mut self, id: ClassId) {
        let class = self.classes[id].as_mut().unwrap();
        debug_assert!(class.queued);
        class.queued = false;
        let popped = self.handles.pop();
        debug_assert!(matches!(popped, Some(ref h) if h.id == id));
    }

    fn grab_capacity(&mut self, ticket: Ticket) -> GrabResult {
        if self.pending.is_some() {
            return self.grab_pending_capacity(ticket);
        }

        let cap = self.group.ticket_capacity(ticket);
        let head_target = self.group.grab_capacity(cap);
        if self.group.capacity_deficiency(head_target) > 0 {
            self.pending = Some(Pending {
                head: head_target,
                cap,
            });
            return GrabResult::Pending;
        }

        GrabResult::Grabbed
    }

    fn grab_pending_capacity(&mut self, ticket: Ticket) -> GrabResult {
        self.group.maybe_replenish(&mut self.group_replenish);

        let pending = self.pending.as_ref().unwrap();
        if self.group.capacity_deficiency(pending.head) > 0 {
            return GrabResult::Pending;
        }

        // The reservation is satisfied, but the heap top may have changed
        // while we waited and may now want more than was reserved.
        let cap = self.group.ticket_capacity(ticket);
        if cap > pending.cap {
            return GrabResult::CantPreempt;
        }
        if cap < pending.cap {
            self.group.release_capacity(pending.cap - cap);
        }
        self.pending = None;
        GrabResult::Grabbed
    }

    /// Reclaim accumulator headroom while preserving the relative order of
    /// queued classes: shift every queued class down by the dispatching
    /// class's accumulator and zero the rest.
    fn renormalize(&mut self, current: ClassId) {
        let base = self.classes[current].as_ref().unwrap().accumulated;
        for class in self.classes.iter_mut().flatten() {
            if class.queued {
                class.accumulated = (class.accumulated - base).max(0);
            } else {
                class.accumulated = 0;
            }
        }
        self.last_accumulated = 0;

        // Heap keys are copies of the accumulators; refresh them.
        let ids: Vec<ClassId> = self.handles.drain().map(|h| h.id).collect();
        let mut handles = BinaryHeap::with_capacity(ids.len());
        for id in ids {
            let accumulated = self.classes[id].as_ref().unwrap().accumulated;
            handles.push(ClassHandle { accumulated, id });
        }
        self.handles = handles;
    }
}
