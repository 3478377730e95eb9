//! The capability handle fibers use to interact with their loop.
//!
//! Every fiber closure receives a [`Cx`] bound to its own identity. All
//! suspension funnels through one primitive: register exactly one wake
//! source (a timer, a listener, or a channel waiter), then park. The loop
//! delivers the wake payload at the parked point, and an error delivery
//! (cancellation or an expired deadline) surfaces there as an `Err` for
//! `?` to propagate.
//!
//! Between registering a wake source and parking, a fiber must not yield;
//! the methods here keep that window closed by construction.

use crate::chan::{select_begin, Channel, Clause, PushOutcome, SelectBegin, SelectOutcome};
use crate::error::{Error, Result};
use crate::ev::{spawn_fiber, Core, FiberId};
use crate::listener::{listen, unlisten, Interest, ListenerId, Machine, Pollable};
use crate::task::Wake;
use crate::timer::{duration_ms, Timeout};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A fiber's handle to its event loop.
///
/// Cheap to clone; all clones refer to the same fiber.
pub struct Cx<T: 'static> {
    pub(crate) core: Rc<RefCell<Core<T>>>,
    pub(crate) fiber: FiberId,
}

impl<T: 'static> Clone for Cx<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            fiber: self.fiber,
        }
    }
}

impl<T: 'static> std::fmt::Debug for Cx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cx").field("fiber", &self.fiber).finish()
    }
}

/// The suspension point. First poll suspends; the next poll takes whatever
/// the loop placed in the fiber's resume slot.
struct Park<T: 'static> {
    core: Rc<RefCell<Core<T>>>,
    fiber: FiberId,
    parked: bool,
}

impl<T: 'static> Future for Park<T> {
    type Output = Result<Wake<T>>;

    fn poll(self: Pin<&mut Self>, _task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.parked {
            this.parked = true;
            return Poll::Pending;
        }
        let mut core = this.core.borrow_mut();
        let Some(rec) = core.fibers.get_mut(this.fiber.key()) else {
            return Poll::Ready(Err(Error::contract("parked fiber has no record")));
        };
        match rec.resume.take() {
            Some(resume) => Poll::Ready(resume),
            None => Poll::Pending,
        }
    }
}

impl<T: 'static> Cx<T> {
    /// The identity of this fiber.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fiber
    }

    fn park_raw(&self) -> Park<T> {
        Park {
            core: Rc::clone(&self.core),
            fiber: self.fiber,
            parked: false,
        }
    }

    /// Suspends until someone resumes this fiber, returning the value it
    /// was resumed with (if any). Cancellation surfaces as an error.
    pub async fn park(&self) -> Result<Option<T>> {
        match self.park_raw().await? {
            Wake::Nil => Ok(None),
            Wake::Item(value) => Ok(Some(value)),
            Wake::Selected(_) => Err(Error::contract("park resumed with a select outcome")),
        }
    }

    /// Suspends this fiber for at least `duration`.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        {
            let mut core = self.core.borrow_mut();
            let sched_id = core
                .sched_id_of(self.fiber)
                .ok_or_else(|| Error::contract("sleeping fiber has no record"))?;
            let when = core.now().saturating_add(duration_ms(duration));
            core.timers.insert(Timeout {
                when,
                fiber: self.fiber,
                sched_id,
                is_error: false,
            });
        }
        self.park_raw().await?;
        Ok(())
    }

    /// Arms a deadline against this fiber's current suspension. If the
    /// fiber is still at the same scheduling epoch when the deadline
    /// expires, it is cancelled with the error message `"timeout"`.
    /// Typically called right before blocking on a listener.
    pub fn add_timeout(&self, duration: Duration) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let sched_id = core
            .sched_id_of(self.fiber)
            .ok_or_else(|| Error::contract("fiber has no record"))?;
        let when = core.now().saturating_add(duration_ms(duration));
        core.timers.insert(Timeout {
            when,
            fiber: self.fiber,
            sched_id,
            is_error: true,
        });
        Ok(())
    }

    /// Sends a value, suspending while the channel is over its limit.
    pub async fn give(&self, chan: &Channel<T>, value: T) -> Result<()> {
        let outcome = {
            let mut core = self.core.borrow_mut();
            chan.push(&mut core, self.fiber, value, false)?
        };
        if outcome == PushOutcome::Blocked {
            self.park_raw().await?;
        }
        Ok(())
    }

    /// Receives a value, suspending while the channel is empty.
    ///
    /// A successful receive is delivered through the ordinary resume path:
    /// the receiver reschedules itself with the value and yields once, then
    /// any writer it released is scheduled behind it.
    pub async fn take(&self, chan: &Channel<T>) -> Result<T> {
        let popped = {
            let mut core = self.core.borrow_mut();
            chan.pop(&mut core, self.fiber, false)?
        };
        if let Some((value, writer)) = popped {
            let mut core = self.core.borrow_mut();
            core.schedule(self.fiber, Wake::Item(value));
            if let Some(w) = writer {
                chan.wake_writer(&mut core, w);
            }
        }
        match self.park_raw().await? {
            Wake::Item(value) => Ok(value),
            _ => Err(Error::contract("take resumed without an item")),
        }
    }

    /// Blocks until the first of several channel operations completes.
    ///
    /// Clauses are tried in positional order: the first receive with a
    /// buffered item or send with room (or a live waiting reader) fires
    /// immediately. Otherwise the fiber registers on every clause and the
    /// first counterparty to act decides the outcome; the losing
    /// registrations go stale and are skipped when they surface later.
    pub async fn select(&self, clauses: Vec<Clause<T>>) -> Result<SelectOutcome<T>> {
        let begin = {
            let mut core = self.core.borrow_mut();
            select_begin(&mut core, self.fiber, clauses)?
        };
        match begin {
            SelectBegin::Fired(outcome) => Ok(outcome),
            SelectBegin::Registered => match self.park_raw().await? {
                Wake::Selected(outcome) => Ok(outcome),
                _ => Err(Error::contract("select resumed without an outcome")),
            },
        }
    }

    /// [`Cx::select`] with the clause order shuffled first, trading the
    /// positional priority for probabilistic fairness.
    pub async fn rselect(&self, clauses: Vec<Clause<T>>) -> Result<SelectOutcome<T>> {
        let clauses = {
            let mut core = self.core.borrow_mut();
            let mut clauses = clauses;
            core.rng.shuffle(&mut clauses);
            clauses
        };
        self.select(clauses).await
    }

    /// Registers a listener owned by this fiber (or a spawner when the mask
    /// says so). The machine receives its init event before this returns;
    /// follow with [`Cx::park`] to block until the machine resumes the
    /// fiber.
    pub fn listen(
        &self,
        pollable: &Pollable,
        machine: Box<dyn Machine<T>>,
        mask: Interest,
    ) -> Result<ListenerId> {
        listen(&self.core, Some(self.fiber), pollable, machine, mask)
    }

    /// Removes a listener. Safe to call with a stale id.
    pub fn unlisten(&self, id: ListenerId) {
        unlisten(&self.core, id);
    }

    /// Schedules another fiber to resume, optionally with a value.
    pub fn resume(&self, fiber: FiberId, value: Option<T>) {
        self.core
            .borrow_mut()
            .schedule(fiber, value.map_or(Wake::Nil, Wake::Item));
    }

    /// Cancels another fiber with an error message.
    pub fn cancel(&self, fiber: FiberId, message: impl Into<String>) {
        self.core
            .borrow_mut()
            .cancel_fiber(fiber, Error::cancelled(message));
    }

    /// Creates and schedules a new fiber on this loop.
    pub fn spawn<F, Fut>(&self, f: F) -> FiberId
    where
        F: FnOnce(Cx<T>) -> Fut,
        Fut: Future<Output = Result<()>> + 'static,
    {
        spawn_fiber(&self.core, f, true)
    }
}
