//! Fiber records and run-queue tasks.

use crate::chan::SelectOutcome;
use crate::error::Result;
use crate::listener::ListenerId;
use crate::util::Key;
use core::fmt;
use std::future::Future;
use std::pin::Pin;

/// Handle to a fiber owned by an event loop.
///
/// Handles are cheap copies and stay valid as identifiers after the fiber
/// completes; operations on a completed fiber are no-ops.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) Key);

impl FiberId {
    pub(crate) const fn key(self) -> Key {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_key(key: Key) -> Self {
        Self(key)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({:?})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0.index())
    }
}

/// The boxed resumable computation behind a fiber. Futures never cross
/// threads, so no `Send` bound applies.
pub(crate) type FiberFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// The payload a fiber is resumed with.
#[derive(Debug)]
pub(crate) enum Wake<T> {
    /// Plain resumption with nothing attached.
    Nil,
    /// A channel item or a value passed to `resume`.
    Item(T),
    /// The outcome of a completed select.
    Selected(SelectOutcome<T>),
}

/// Per-fiber bookkeeping.
pub(crate) struct FiberRecord<T> {
    /// Taken out while the fiber is being polled, present while suspended.
    pub future: Option<FiberFuture>,
    /// Scheduling epoch; bumped on every scheduling. Queued wake-ups carry
    /// the epoch they were registered under and go stale when it moves.
    pub sched_id: u32,
    /// Set while the fiber sits in the run queue.
    pub scheduled: bool,
    /// The listener this fiber is blocked on, if any.
    pub waiting: Option<ListenerId>,
    /// Value delivered at the next suspension point.
    pub resume: Option<Result<Wake<T>>>,
}

impl<T> FiberRecord<T> {
    pub(crate) const fn new() -> Self {
        Self {
            future: None,
            sched_id: 0,
            scheduled: false,
            waiting: None,
            resume: None,
        }
    }
}

/// One entry in the run queue.
pub(crate) struct Task<T> {
    pub fiber: FiberId,
    pub resume: Result<Wake<T>>,
}
