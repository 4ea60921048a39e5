//! Metric accumulators: the five-field counter snapshot and the per-edge
//! counter that folds interval deltas into running totals.
//!
//! Time fields are microseconds; heap fields are bytes. Deltas between
//! snapshots use saturating subtraction so a wrapped OS counter reads as a
//! zero-width interval instead of a giant bogus value.

use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::Instant;

use crate::info::ThreadInfoSource;

/// The metrics tracked for every scope transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// CPU time spent in user mode, microseconds.
    CpuUser,
    /// CPU time spent in kernel mode, microseconds.
    CpuSys,
    /// Monotonic wall-clock time, microseconds.
    WallClock,
    /// Heap bytes allocated.
    HeapAlloc,
    /// Heap bytes deallocated.
    HeapDealloc,
}

impl Metric {
    pub const COUNT: usize = 5;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Process-start anchor for wall-clock readings.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn wall_now_us() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// An instantaneous read of cumulative CPU/wall/heap metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    values: [u64; Metric::COUNT],
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            values: [0; Metric::COUNT],
        }
    }

    /// Snapshot the current thread-scoped totals: CPU times from the
    /// metadata provider (refreshed first), wall clock from the process
    /// epoch, heap bytes from the caller (the allocator hook's thread-local
    /// totals are only readable on the owning thread, so they are passed in).
    pub(crate) fn now(info: &dyn ThreadInfoSource, heap: (u64, u64)) -> Self {
        info.update();
        let mut counter = Self::new();
        counter.set(Metric::CpuUser, info.cpu_user_time());
        counter.set(Metric::CpuSys, info.cpu_system_time());
        counter.set(Metric::WallClock, wall_now_us());
        counter.set(Metric::HeapAlloc, heap.0);
        counter.set(Metric::HeapDealloc, heap.1);
        counter
    }

    pub fn value(&self, metric: Metric) -> u64 {
        self.values[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: u64) {
        self.values[metric.index()] = value;
    }
}

impl AddAssign for Counter {
    fn add_assign(&mut self, other: Self) {
        for i in 0..Metric::COUNT {
            self.values[i] += other.values[i];
        }
    }
}

impl Add for Counter {
    type Output = Counter;

    fn add(mut self, other: Self) -> Counter {
        self += other;
        self
    }
}

impl Sub for Counter {
    type Output = Counter;

    /// Element-wise saturating difference. Counter wraparound in the
    /// underlying OS facility must be tolerated, not treated as fatal.
    fn sub(mut self, other: Self) -> Counter {
        for i in 0..Metric::COUNT {
            self.values[i] = self.values[i].saturating_sub(other.values[i]);
        }
        self
    }
}

/// The accumulator owned by exactly one (parent, child) pair within one
/// thread's graph.
///
/// `in_flight` holds the start snapshot of every currently-open instance of
/// this edge, innermost last. It is empty for a closed edge and holds one
/// snapshot in the common case; a recursive self-loop holds one per depth,
/// so the accumulated total is the sum of the inclusive durations of every
/// nested invocation rather than just the innermost one.
#[derive(Debug, Clone, Default)]
pub struct EdgeCounter {
    total: Counter,
    in_flight: Vec<Counter>,
}

impl EdgeCounter {
    pub fn is_completed(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Open one instance of this edge.
    pub(crate) fn start(&mut self, now: Counter) {
        self.in_flight.push(now);
    }

    /// Close the innermost open instance, folding its elapsed delta into the
    /// cumulative total. A stop with nothing in flight is a no-op.
    pub(crate) fn stop(&mut self, now: Counter) {
        if let Some(start) = self.in_flight.pop() {
            self.total += now - start;
        }
    }

    /// Fold the interim delta of every open instance into the total without
    /// closing any of them. Used by the dump path so an export reflects
    /// in-flight work; cumulative values stay monotonically non-decreasing.
    pub(crate) fn update(&mut self, now: Counter) {
        for start in &mut self.in_flight {
            self.total += now - *start;
            *start = now;
        }
    }

    pub fn total(&self) -> &Counter {
        &self.total
    }
}
