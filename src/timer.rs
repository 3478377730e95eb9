//! Timeout min-heap and millisecond clock.
//!
//! Timeouts are keyed by an absolute millisecond timestamp and carry the
//! scheduling epoch of the fiber that registered them. The loop pops expired
//! entries in non-decreasing `when` order; an entry whose epoch no longer
//! matches its fiber is dropped without effect, which is the only way a
//! queued timeout is ever cancelled. Ties between equal timestamps break on
//! insertion order.

use crate::ev::FiberId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Milliseconds since the loop's clock anchor. Signed 64-bit throughout.
pub type Timestamp = i64;

/// Monotonic millisecond clock anchored at loop creation.
#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the current timestamp.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::try_from(self.start.elapsed().as_millis()).unwrap_or(Timestamp::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a duration to whole milliseconds, saturating at the type limit.
#[must_use]
pub fn duration_ms(duration: Duration) -> Timestamp {
    Timestamp::try_from(duration.as_millis()).unwrap_or(Timestamp::MAX)
}

/// A pending wake-up for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Absolute deadline in loop milliseconds.
    pub when: Timestamp,
    /// The fiber to wake.
    pub fiber: FiberId,
    /// The fiber's scheduling epoch at registration.
    pub sched_id: u32,
    /// Whether expiry cancels the fiber instead of resuming it.
    pub is_error: bool,
}

#[derive(Debug)]
struct HeapEntry {
    timeout: Timeout,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timeout.when == other.timeout.when && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap max is the earliest deadline.
        other
            .timeout
            .when
            .cmp(&self.timeout.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timeouts ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TimerHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pending timeouts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no timeouts are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Adds a timeout.
    pub fn insert(&mut self, timeout: Timeout) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { timeout, seq });
    }

    /// Returns a copy of the earliest timeout without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Timeout> {
        self.heap.peek().map(|e| e.timeout)
    }

    /// Removes and returns the earliest timeout.
    pub fn pop(&mut self) -> Option<Timeout> {
        self.heap.pop().map(|e| e.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::util::Key;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn fiber(n: usize) -> FiberId {
        FiberId::from_key(Key::from_usize(n))
    }

    fn timeout(when: Timestamp, n: usize) -> Timeout {
        Timeout {
            when,
            fiber: fiber(n),
            sched_id: 0,
            is_error: false,
        }
    }

    #[test]
    fn empty_heap_has_no_top() {
        init_test("empty_heap_has_no_top");
        let heap = TimerHeap::new();
        crate::assert_with_log!(heap.is_empty(), "heap empty", true, heap.is_empty());
        crate::assert_with_log!(heap.peek().is_none(), "no top", true, heap.peek().is_none());
        crate::test_complete!("empty_heap_has_no_top");
    }

    #[test]
    fn earliest_deadline_surfaces_first() {
        init_test("earliest_deadline_surfaces_first");
        let mut heap = TimerHeap::new();
        heap.insert(timeout(200, 1));
        heap.insert(timeout(50, 2));
        heap.insert(timeout(125, 3));
        let order: Vec<Timestamp> = std::iter::from_fn(|| heap.pop()).map(|t| t.when).collect();
        crate::assert_with_log!(
            order == vec![50, 125, 200],
            "pop order by deadline",
            vec![50, 125, 200],
            order
        );
        crate::test_complete!("earliest_deadline_surfaces_first");
    }

    #[test]
    fn ties_break_on_insertion_order() {
        init_test("ties_break_on_insertion_order");
        let mut heap = TimerHeap::new();
        heap.insert(timeout(100, 1));
        heap.insert(timeout(100, 2));
        heap.insert(timeout(100, 3));
        let order: Vec<FiberId> = std::iter::from_fn(|| heap.pop()).map(|t| t.fiber).collect();
        assert_eq!(order, vec![fiber(1), fiber(2), fiber(3)]);
        crate::test_complete!("ties_break_on_insertion_order");
    }

    #[test]
    fn peek_leaves_heap_intact() {
        let mut heap = TimerHeap::new();
        heap.insert(timeout(10, 1));
        heap.insert(timeout(5, 2));
        assert_eq!(heap.peek().map(|t| t.when), Some(5));
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a >= 0);
    }

    #[test]
    fn duration_conversion_rounds_down() {
        assert_eq!(duration_ms(Duration::from_millis(30)), 30);
        assert_eq!(duration_ms(Duration::from_micros(1500)), 1);
        assert_eq!(duration_ms(Duration::ZERO), 0);
    }
}
