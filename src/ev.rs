//! The event loop: fiber table, run queue, timers, and the blocking step.
//!
//! One loop drives everything on its thread. A pass of [`EvLoop::step`]
//! schedules expired timers, drains the run queue, and then blocks in the
//! backend until the next readiness event or deadline. [`EvLoop::run`]
//! repeats passes until no listener, queued task, or timer remains; those
//! three emptiness conditions are exactly the termination test.
//!
//! Scheduling is idempotent: a fiber already sitting in the run queue is
//! not queued again. Every scheduling bumps the fiber's epoch, which is the
//! entire cancellation story; timeouts and channel waiters registered under
//! an older epoch are dropped when they surface.

use crate::cx::Cx;
use crate::error::{Error, Result};
use crate::listener::{
    close_pollable, dispatch_ready, listen, unlisten, Interest, ListenerId, ListenerRecord,
    Machine, Pollable, PollableState,
};
use crate::poll::{Backend, Events, SysBackend};
use crate::ring::Ring;
use crate::task::{FiberFuture, FiberRecord, Task, Wake};
use crate::timer::{Clock, TimerHeap, Timestamp};
use crate::util::{DetRng, Slab};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

pub use crate::task::FiberId;

/// Events retrieved from the backend per blocking wait.
const EVENTS_PER_WAIT: usize = 64;

/// Shared mutable loop state. Everything lives on one thread behind a
/// single `RefCell`; the discipline is that the cell is never held across a
/// fiber poll or a machine dispatch.
pub(crate) struct Core<T: 'static> {
    pub(crate) fibers: Slab<FiberRecord<T>>,
    pub(crate) listeners: Slab<ListenerRecord<T>>,
    pub(crate) polls: Slab<Rc<RefCell<PollableState>>>,
    pub(crate) run_queue: Ring<Task<T>>,
    pub(crate) timers: TimerHeap,
    pub(crate) active_listeners: usize,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) rng: DetRng,
    pub(crate) clock: Clock,
}

impl<T: 'static> Core<T> {
    fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            fibers: Slab::new(),
            listeners: Slab::new(),
            polls: Slab::new(),
            run_queue: Ring::new(),
            timers: TimerHeap::new(),
            active_listeners: 0,
            backend,
            rng: DetRng::new(0),
            clock: Clock::new(),
        }
    }

    /// Queues a fiber for resumption. A no-op if the fiber is already
    /// queued or has completed. Bumps the fiber's scheduling epoch.
    pub(crate) fn schedule_signal(&mut self, fiber: FiberId, resume: Result<Wake<T>>) {
        let Some(rec) = self.fibers.get_mut(fiber.key()) else {
            tracing::trace!(fiber = %fiber, "schedule on a completed fiber ignored");
            return;
        };
        if rec.scheduled {
            return;
        }
        rec.scheduled = true;
        rec.sched_id = rec.sched_id.wrapping_add(1);
        tracing::trace!(fiber = %fiber, sched_id = rec.sched_id, ok = resume.is_ok(), "fiber scheduled");
        assert!(
            self.run_queue.push(Task { fiber, resume }).is_ok(),
            "run queue exceeded its capacity ceiling"
        );
    }

    pub(crate) fn schedule(&mut self, fiber: FiberId, wake: Wake<T>) {
        self.schedule_signal(fiber, Ok(wake));
    }

    pub(crate) fn cancel_fiber(&mut self, fiber: FiberId, err: Error) {
        self.schedule_signal(fiber, Err(err));
    }

    /// Returns true if the fiber exists and its epoch still matches.
    pub(crate) fn is_current(&self, fiber: FiberId, sched_id: u32) -> bool {
        self.fibers
            .get(fiber.key())
            .is_some_and(|rec| rec.sched_id == sched_id)
    }

    pub(crate) fn sched_id_of(&self, fiber: FiberId) -> Option<u32> {
        self.fibers.get(fiber.key()).map(|rec| rec.sched_id)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

struct NoopWake;

impl std::task::Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

thread_local! {
    static NOOP_WAKER: Waker = Waker::from(Arc::new(NoopWake));
}

/// Creates a fiber record with its future and optionally schedules it.
pub(crate) fn spawn_fiber<T, F, Fut>(
    core: &Rc<RefCell<Core<T>>>,
    f: F,
    schedule: bool,
) -> FiberId
where
    T: 'static,
    F: FnOnce(Cx<T>) -> Fut,
    Fut: Future<Output = Result<()>> + 'static,
{
    let id = FiberId(core.borrow_mut().fibers.insert(FiberRecord::new()));
    let cx = Cx {
        core: Rc::clone(core),
        fiber: id,
    };
    let future: FiberFuture = Box::pin(f(cx));
    {
        let mut c = core.borrow_mut();
        if let Some(rec) = c.fibers.get_mut(id.key()) {
            rec.future = Some(future);
        }
    }
    tracing::debug!(fiber = %id, "fiber created");
    if schedule {
        core.borrow_mut().schedule(id, Wake::Nil);
    }
    id
}

/// Resumes one fiber: clears its queued flag, tears down the listener it
/// was blocked on, delivers the resume payload, and polls. `Pending` means
/// the fiber suspended again; completion removes its record, and an error
/// completion is reported to the error sink.
fn run_one<T: 'static>(core: &Rc<RefCell<Core<T>>>, task: Task<T>) {
    let (waiting, future) = {
        let mut c = core.borrow_mut();
        let Some(rec) = c.fibers.get_mut(task.fiber.key()) else {
            return;
        };
        rec.scheduled = false;
        rec.resume = Some(task.resume);
        (rec.waiting.take(), rec.future.take())
    };
    if let Some(listener) = waiting {
        // The fiber is resuming by another path while blocked on I/O;
        // its wait is over.
        unlisten(core, listener);
    }
    let Some(mut future) = future else {
        return;
    };
    let waker = NOOP_WAKER.with(Clone::clone);
    let mut task_cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut task_cx) {
        Poll::Pending => {
            let mut c = core.borrow_mut();
            if let Some(rec) = c.fibers.get_mut(task.fiber.key()) {
                rec.future = Some(future);
            }
        }
        Poll::Ready(Ok(())) => {
            tracing::trace!(fiber = %task.fiber, "fiber completed");
            core.borrow_mut().fibers.remove(task.fiber.key());
        }
        Poll::Ready(Err(e)) => {
            tracing::error!(fiber = %task.fiber, error = %e, "fiber terminated with error");
            core.borrow_mut().fibers.remove(task.fiber.key());
        }
    }
}

/// A single-threaded cooperative event loop.
///
/// The loop multiplexes fibers, millisecond timers, and I/O readiness onto
/// one backend. It is deliberately not `Send`: loops on different threads
/// are fully independent and share nothing.
///
/// # Example
///
/// ```no_run
/// use fiberloop::EvLoop;
/// use std::time::Duration;
///
/// let ev: EvLoop<String> = EvLoop::new().unwrap();
/// ev.spawn(|cx| async move {
///     cx.sleep(Duration::from_millis(10)).await?;
///     Ok(())
/// });
/// ev.run().unwrap();
/// ```
pub struct EvLoop<T: 'static> {
    core: Rc<RefCell<Core<T>>>,
    events: RefCell<Events>,
}

impl<T: 'static> EvLoop<T> {
    /// Creates a loop on the OS readiness backend.
    pub fn new() -> Result<Self> {
        let backend = SysBackend::new().map_err(Error::backend)?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    /// Creates a loop on a caller-provided backend.
    #[must_use]
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core::new(backend))),
            events: RefCell::new(Events::with_capacity(EVENTS_PER_WAIT)),
        }
    }

    /// Reseeds the shuffle generator behind randomized select.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        self.core.borrow_mut().rng = DetRng::new(seed);
        self
    }

    /// Creates a fiber without scheduling it. Pair with [`EvLoop::resume`].
    pub fn fiber<F, Fut>(&self, f: F) -> FiberId
    where
        F: FnOnce(Cx<T>) -> Fut,
        Fut: Future<Output = Result<()>> + 'static,
    {
        spawn_fiber(&self.core, f, false)
    }

    /// Creates a fiber and schedules it to run with no resume value.
    pub fn spawn<F, Fut>(&self, f: F) -> FiberId
    where
        F: FnOnce(Cx<T>) -> Fut,
        Fut: Future<Output = Result<()>> + 'static,
    {
        spawn_fiber(&self.core, f, true)
    }

    /// Schedules a fiber to resume, optionally with a value. A no-op for
    /// completed fibers and for fibers already queued.
    pub fn resume(&self, fiber: FiberId, value: Option<T>) {
        self.core
            .borrow_mut()
            .schedule(fiber, value.map_or(Wake::Nil, Wake::Item));
    }

    /// Schedules a fiber to resume with an error carrying `message`. The
    /// fiber observes the error at its suspension point; if it is blocked
    /// on a listener, the listener is torn down before it resumes.
    pub fn cancel(&self, fiber: FiberId, message: impl Into<String>) {
        self.core
            .borrow_mut()
            .cancel_fiber(fiber, Error::cancelled(message));
    }

    /// Registers a spawner listener (one with no owning fiber) on a
    /// pollable. The mask must carry [`Interest::SPAWNER`].
    pub fn listen(
        &self,
        pollable: &Pollable,
        machine: Box<dyn Machine<T>>,
        mask: Interest,
    ) -> Result<ListenerId> {
        listen(&self.core, None, pollable, machine, mask)
    }

    /// Removes a listener. Safe to call with a stale id.
    pub fn unlisten(&self, id: ListenerId) {
        unlisten(&self.core, id);
    }

    /// Tears down a pollable: every listener receives a close event and is
    /// removed. The OS handle itself is not closed.
    pub fn close(&self, pollable: &Pollable) {
        close_pollable(&self.core, pollable);
    }

    /// Number of registered listeners across all pollables.
    #[must_use]
    pub fn active_listeners(&self) -> usize {
        self.core.borrow().active_listeners
    }

    /// Number of pending timeouts, stale entries included.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.core.borrow().timers.len()
    }

    /// One pass of the loop: fire expired timers, drain the run queue, then
    /// block in the backend until the next event or deadline.
    pub fn step(&self) -> Result<()> {
        // Expired timers. Entries whose epoch moved on are dropped.
        {
            let mut c = self.core.borrow_mut();
            let now = c.now();
            while let Some(top) = c.timers.peek() {
                if top.when > now {
                    break;
                }
                let Some(timeout) = c.timers.pop() else {
                    break;
                };
                if c.is_current(timeout.fiber, timeout.sched_id) {
                    if timeout.is_error {
                        tracing::trace!(fiber = %timeout.fiber, "deadline expired");
                        c.cancel_fiber(timeout.fiber, Error::timeout());
                    } else {
                        tracing::trace!(fiber = %timeout.fiber, "timer fired");
                        c.schedule(timeout.fiber, Wake::Nil);
                    }
                }
            }
        }

        // Drain the run queue.
        loop {
            let task = self.core.borrow_mut().run_queue.pop();
            let Some(task) = task else { break };
            run_one(&self.core, task);
        }

        // Block for the next event, bounded by the nearest live deadline.
        let timeout = {
            let mut c = self.core.borrow_mut();
            if c.active_listeners == 0 && c.timers.is_empty() {
                return Ok(());
            }
            let deadline: Option<Timestamp> = loop {
                match c.timers.peek() {
                    Some(top) if c.is_current(top.fiber, top.sched_id) => break Some(top.when),
                    Some(_) => {
                        c.timers.pop();
                    }
                    None => break None,
                }
            };
            if deadline.is_none() && c.active_listeners == 0 {
                // Only stale timers remained; nothing left to wait for.
                return Ok(());
            }
            deadline.map(|when| {
                let now = c.now();
                if now >= when {
                    Duration::ZERO
                } else {
                    Duration::from_millis((when - now) as u64)
                }
            })
        };

        let mut events = self.events.borrow_mut();
        events.clear();
        {
            let mut c = self.core.borrow_mut();
            if let Err(e) = c.backend.wait(&mut events, timeout) {
                tracing::error!(error = %e, "backend wait failed");
                return Err(Error::backend(e));
            }
        }
        for event in events.iter() {
            dispatch_ready(&self.core, event.token, event.ready);
        }
        Ok(())
    }

    /// Runs passes until no listener, queued fiber, or timer remains.
    pub fn run(&self) -> Result<()> {
        loop {
            let alive = {
                let c = self.core.borrow();
                c.active_listeners > 0 || !c.run_queue.is_empty() || !c.timers.is_empty()
            };
            if !alive {
                return Ok(());
            }
            self.step()?;
        }
    }
}

impl<T: 'static> std::fmt::Debug for EvLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.core.borrow();
        f.debug_struct("EvLoop")
            .field("fibers", &c.fibers.len())
            .field("active_listeners", &c.active_listeners)
            .field("queued", &c.run_queue.len())
            .field("timers", &c.timers.len())
            .finish_non_exhaustive()
    }
}
