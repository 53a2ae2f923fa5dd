//! Timekeeping and the timer wheel.
//!
//! gtk-gnutella drives every deadline off a single process-wide *callout
//! queue* (`cq_insert`/`cq_resched`/`cq_cancel`) serviced by the main
//! event loop. This crate is a library, not an event loop, so it exposes
//! the same idea as a small data structure ([`TimerWheel`]) that an
//! embedding application polls: "what's due, and what's next". The
//! [`Clock`] trait (mirroring `tm_time()`) lets tests supply a fake,
//! hand-advanced clock instead of wall time.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

pub use wasm_timer::Instant;

use crate::ids::QueryId;

/// Source of the current time. Implemented by [`SystemClock`] for
/// production use and by [`FakeClock`] in tests.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall-clock time via `wasm_timer::Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock a test can advance by hand, so timer behavior (results-timer
/// decay, linger expiry, status-request timeout) can be exercised
/// deterministically without sleeping.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Instant,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock { now: Instant::now() }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.now
    }
}

/// Opaque handle to a scheduled timer. Stable for the timer's lifetime;
/// reused slots are never handed out while a handle referencing them is
/// still outstanding (the wheel never reuses an id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Which per-query deadline a fired timer corresponds to (spec §3: a
/// query carries two independent timer handles).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// The global safety-net deadline (`expire_at`): armed at creation,
    /// rescheduled to the linger window at termination, always exactly
    /// one of these per live query.
    Expire,
    /// The results-wait deadline (`results_timer`): armed whenever the
    /// controller is waiting on probe results or leaf guidance; absent
    /// while lingering.
    Results,
}

struct Entry {
    query: QueryId,
    kind: TimerKind,
}

/// A min-heap of deadlines with lazy cancellation: cancelling a timer
/// just removes its bookkeeping entry so that when (if) it is popped from
/// the heap it is silently discarded, rather than requiring an O(n)
/// removal from the heap itself.
pub struct TimerWheel {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: fnv::FnvHashMap<TimerId, Entry>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        TimerWheel {
            next_id: 0,
            heap: BinaryHeap::new(),
            live: fnv::FnvHashMap::default(),
        }
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deadline: Instant, query: QueryId, kind: TimerKind) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, Entry { query, kind });
        id
    }

    /// Cancel a previously-armed timer. A no-op if it already fired or was
    /// already cancelled (idempotent, per spec §8's cancellation law).
    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    /// Deadline of the earliest still-live timer, for a host event loop
    /// deciding how long to block. Discards any already-cancelled entries
    /// it finds sitting at the top of the heap along the way (`BinaryHeap`
    /// does not iterate in sorted order, so peeking/popping the top is the
    /// only way to find the true minimum under lazy deletion).
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((when, id))) = self.heap.peek().copied() {
            if self.live.contains_key(&id) {
                return Some(when);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop and return every timer whose deadline is `<= now` and which has
    /// not been cancelled since it was armed.
    pub fn fire_due(&mut self, now: Instant) -> Vec<(TimerId, QueryId, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(Reverse((when, id))) = self.heap.peek().copied() {
            if when > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.live.remove(&id) {
                fired.push((id, entry.query, entry.kind));
            }
        }
        fired
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.live.contains_key(&id)
    }
}
