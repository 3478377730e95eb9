//! Pollables and listener state machines.
//!
//! A [`Pollable`] wraps a raw OS handle with a chain of listeners and the
//! aggregate event mask the chain is interested in. A listener binds a
//! [`Machine`] (a small state machine driving one I/O operation) to a
//! pollable and, unless it is a spawner, to the fiber that is blocked on it.
//!
//! Lifecycle: `listen` inserts the listener into the chain, widens the
//! pollable's OS registration when the mask grows, marks the owning fiber as
//! waiting, and dispatches [`EventKind::Init`] synchronously. `unlisten`
//! reverses all of it and dispatches [`EventKind::Deinit`]. A listener is
//! reachable from exactly two places, its pollable's chain and its owning
//! fiber's waiting slot, and `unlisten` clears both together.
//!
//! Readiness dispatch delivers at most one `Write` and one `Read` per
//! listener per wake, write first. A machine returning [`Status::Done`]
//! from any dispatch is unlistened.

use crate::error::{Error, Result};
use crate::ev::{spawn_fiber, Core, FiberId};
use crate::poll::Token;
use crate::task::Wake;
use crate::util::Key;
use std::cell::RefCell;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Event mask and readiness flags.
///
/// `READABLE` and `WRITABLE` select which readiness events a listener wants
/// and which a backend reports. `SPAWNER` marks a listener that services a
/// passively listening resource and therefore has no owning fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// The empty mask.
    pub const NONE: Interest = Interest(0);
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(0b001);
    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(0b010);
    /// Listener without an owning fiber.
    pub const SPAWNER: Interest = Interest(0b100);

    /// Returns the union of two masks.
    #[must_use]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Returns true if any bit is shared with `other`.
    #[must_use]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns only the read/write bits.
    #[must_use]
    pub const fn rw(self) -> Interest {
        Interest(self.0 & 0b011)
    }

    /// Returns true if the read bit is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if the write bit is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if the spawner bit is set.
    #[must_use]
    pub const fn is_spawner(self) -> bool {
        self.0 & Self::SPAWNER.0 != 0
    }
}

/// Lifecycle and readiness events delivered to a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Dispatched synchronously inside `listen`.
    Init,
    /// Dispatched synchronously inside `unlisten`.
    Deinit,
    /// The owning pollable is being torn down.
    Close,
    /// The handle reported read readiness (or hangup/error).
    Read,
    /// The handle reported write readiness.
    Write,
}

/// Whether a machine has finished its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The listener should be removed.
    Done,
    /// The listener stays armed.
    NotDone,
}

/// A state machine driving one I/O operation.
///
/// Machines own their working state (buffers, cursors, protocol position)
/// and receive lifecycle plus readiness events. On an edge-triggered
/// backend a machine must keep reading or writing until the OS reports
/// `WouldBlock`, because the next notification only comes on a fresh edge.
pub trait Machine<T: 'static> {
    /// Handles one event. Returning [`Status::Done`] unlistens the machine.
    fn on_event(&mut self, dispatch: &mut Dispatch<T>, event: EventKind) -> Status;
}

/// Handle to a registered listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) Key);

impl std::fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListenerId({:?})", self.0)
    }
}

pub(crate) struct ListenerRecord<T: 'static> {
    /// Taken out for the duration of a dispatch.
    pub machine: Option<Box<dyn Machine<T>>>,
    pub fiber: Option<FiberId>,
    pub pollable: Rc<RefCell<PollableState>>,
    pub mask: Interest,
}

#[derive(Debug)]
pub(crate) struct PollableState {
    pub fd: RawFd,
    pub closed: bool,
    /// Backend registration slot, present while any listener is attached.
    pub registered: Option<Key>,
    pub chain: Vec<ListenerId>,
    /// Union of the masks of every listener in the chain.
    pub mask: Interest,
}

/// An OS handle wrapped with a listener chain and an event mask.
///
/// Pollables are externally owned: the loop never opens or closes the
/// underlying handle. Cloning yields another reference to the same state.
#[derive(Debug, Clone)]
pub struct Pollable {
    pub(crate) state: Rc<RefCell<PollableState>>,
}

impl Pollable {
    /// Wraps a raw handle. The handle should be in non-blocking mode.
    #[must_use]
    pub fn new(fd: RawFd) -> Self {
        Self {
            state: Rc::new(RefCell::new(PollableState {
                fd,
                closed: false,
                registered: None,
                chain: Vec::new(),
                mask: Interest::NONE,
            })),
        }
    }

    /// Returns the wrapped handle.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.state.borrow().fd
    }

    /// Returns true once the pollable has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Returns the union of the masks of all attached listeners.
    #[must_use]
    pub fn mask(&self) -> Interest {
        self.state.borrow().mask
    }

    /// Returns the number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.borrow().chain.len()
    }
}

impl PartialEq for Pollable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

/// Context handed to a [`Machine`] during a dispatch.
pub struct Dispatch<T: 'static> {
    pub(crate) core: Rc<RefCell<Core<T>>>,
    pub(crate) fiber: Option<FiberId>,
    pub(crate) fd: RawFd,
    pub(crate) listener: ListenerId,
}

impl<T: 'static> Dispatch<T> {
    /// The fiber blocked on this listener, absent for spawners.
    #[must_use]
    pub fn fiber(&self) -> Option<FiberId> {
        self.fiber
    }

    /// The raw handle of the listener's pollable.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// The listener being dispatched.
    #[must_use]
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Schedules a fiber to resume with `value` (or with nothing).
    pub fn schedule(&mut self, fiber: FiberId, value: Option<T>) {
        self.core
            .borrow_mut()
            .schedule(fiber, value.map_or(Wake::Nil, Wake::Item));
    }

    /// Cancels a fiber with an error message.
    pub fn cancel(&mut self, fiber: FiberId, message: impl Into<String>) {
        self.core
            .borrow_mut()
            .cancel_fiber(fiber, Error::cancelled(message));
    }

    /// Creates and schedules a new fiber. This is how spawner machines turn
    /// incoming events into running work.
    pub fn spawn<F, Fut>(&mut self, f: F) -> FiberId
    where
        F: FnOnce(crate::cx::Cx<T>) -> Fut,
        Fut: Future<Output = Result<()>> + 'static,
    {
        spawn_fiber(&self.core, f, true)
    }
}

/// Registers a listener on a pollable.
///
/// `owner` is the fiber that will block on the listener; it must be `None`
/// exactly when the mask carries [`Interest::SPAWNER`]. Dispatches
/// [`EventKind::Init`] synchronously before returning.
pub(crate) fn listen<T: 'static>(
    core: &Rc<RefCell<Core<T>>>,
    owner: Option<FiberId>,
    pollable: &Pollable,
    machine: Box<dyn Machine<T>>,
    mask: Interest,
) -> Result<ListenerId> {
    let owner = if mask.is_spawner() { None } else { owner };
    let id = {
        let mut c = core.borrow_mut();
        let mut p = pollable.state.borrow_mut();
        if p.closed {
            return Err(Error::contract("cannot listen on a closed pollable"));
        }
        if mask.rw() == Interest::NONE {
            return Err(Error::contract(
                "listener mask needs read or write interest",
            ));
        }
        if mask.rw().intersects(p.mask) {
            return Err(Error::contract(
                "cannot listen for duplicate event on pollable",
            ));
        }
        if let Some(f) = owner {
            let rec = c
                .fibers
                .get(f.key())
                .ok_or_else(|| Error::contract("owning fiber is gone"))?;
            if rec.waiting.is_some() {
                return Err(Error::contract("fiber is already waiting for an event"));
            }
        } else if !mask.is_spawner() {
            return Err(Error::contract(
                "listener without an owning fiber must set the spawner mask",
            ));
        }

        let record = ListenerRecord {
            machine: Some(machine),
            fiber: owner,
            pollable: Rc::clone(&pollable.state),
            mask,
        };
        let id = ListenerId(c.listeners.insert(record));
        p.chain.push(id);
        let old_mask = p.mask;
        p.mask = p.mask.add(mask);
        if let Some(f) = owner {
            if let Some(rec) = c.fibers.get_mut(f.key()) {
                rec.waiting = Some(id);
            }
        }
        c.active_listeners += 1;

        let fresh = p.registered.is_none();
        let os_result = if fresh {
            let token_key = c.polls.insert(Rc::clone(&pollable.state));
            p.registered = Some(token_key);
            c.backend.add(p.fd, Token(token_key.to_usize()), p.mask)
        } else if p.mask.rw() == old_mask.rw() {
            Ok(())
        } else {
            let token_key = p.registered.unwrap_or_else(|| unreachable!());
            c.backend.modify(p.fd, Token(token_key.to_usize()), p.mask)
        };

        if let Err(e) = os_result {
            tracing::error!(fd = p.fd, error = %e, "failed to register interest");
            c.listeners.remove(id.0);
            p.chain.pop();
            p.mask = old_mask;
            if let Some(f) = owner {
                if let Some(rec) = c.fibers.get_mut(f.key()) {
                    rec.waiting = None;
                }
            }
            c.active_listeners -= 1;
            if fresh {
                if let Some(token_key) = p.registered.take() {
                    c.polls.remove(token_key);
                }
            }
            return Err(Error::backend(e));
        }
        tracing::debug!(fd = p.fd, listener = ?id, mask = ?mask, "listener registered");
        id
    };

    if dispatch_event(core, id, EventKind::Init) == Status::Done {
        unlisten(core, id);
    }
    Ok(id)
}

/// Removes a listener, dispatching [`EventKind::Deinit`] synchronously.
///
/// Safe to call with a stale id; removal happens at most once.
pub(crate) fn unlisten<T: 'static>(core: &Rc<RefCell<Core<T>>>, id: ListenerId) {
    let detached = {
        let mut c = core.borrow_mut();
        let Some(rec) = c.listeners.remove(id.0) else {
            return;
        };
        {
            let mut p = rec.pollable.borrow_mut();
            if let Some(pos) = p.chain.iter().position(|l| *l == id) {
                p.chain.remove(pos);
            } else {
                debug_assert!(false, "listener missing from its pollable chain");
            }
            let mut mask = Interest::NONE;
            for l in &p.chain {
                if let Some(other) = c.listeners.get(l.0) {
                    mask = mask.add(other.mask);
                }
            }
            p.mask = mask;
            if p.chain.is_empty() {
                if let Some(token_key) = p.registered.take() {
                    c.polls.remove(token_key);
                    if let Err(e) = c.backend.delete(p.fd) {
                        tracing::error!(fd = p.fd, error = %e, "failed to deregister handle");
                    }
                }
            } else if let Some(token_key) = p.registered {
                if let Err(e) = c
                    .backend
                    .modify(p.fd, Token(token_key.to_usize()), p.mask)
                {
                    tracing::error!(fd = p.fd, error = %e, "failed to narrow interest");
                }
            }
            tracing::debug!(fd = p.fd, listener = ?id, "listener removed");
        }
        c.active_listeners -= 1;
        if let Some(f) = rec.fiber {
            if let Some(fiber_rec) = c.fibers.get_mut(f.key()) {
                if fiber_rec.waiting == Some(id) {
                    fiber_rec.waiting = None;
                }
            }
        }
        rec
    };

    if let Some(mut machine) = detached.machine {
        let fd = detached.pollable.borrow().fd;
        let mut dispatch = Dispatch {
            core: Rc::clone(core),
            fiber: detached.fiber,
            fd,
            listener: id,
        };
        let _ = machine.on_event(&mut dispatch, EventKind::Deinit);
    }
}

/// Tears down a pollable: dispatches [`EventKind::Close`] to every listener
/// in the chain, then unlistens each. Does not close the OS handle.
pub(crate) fn close_pollable<T: 'static>(core: &Rc<RefCell<Core<T>>>, pollable: &Pollable) {
    {
        let mut p = pollable.state.borrow_mut();
        if p.closed {
            return;
        }
        p.closed = true;
    }
    let chain: Vec<ListenerId> = pollable.state.borrow().chain.clone();
    for id in chain {
        let _ = dispatch_event(core, id, EventKind::Close);
        unlisten(core, id);
    }
}

/// Delivers one event to a listener's machine, with the machine temporarily
/// taken out of its record so it may schedule fibers reentrantly. Returns
/// [`Status::NotDone`] if the listener no longer exists.
pub(crate) fn dispatch_event<T: 'static>(
    core: &Rc<RefCell<Core<T>>>,
    id: ListenerId,
    event: EventKind,
) -> Status {
    let taken = {
        let mut c = core.borrow_mut();
        c.listeners.get_mut(id.0).and_then(|rec| {
            let fd = rec.pollable.borrow().fd;
            rec.machine.take().map(|m| (m, rec.fiber, fd))
        })
    };
    let Some((mut machine, fiber, fd)) = taken else {
        return Status::NotDone;
    };
    let mut dispatch = Dispatch {
        core: Rc::clone(core),
        fiber,
        fd,
        listener: id,
    };
    let status = machine.on_event(&mut dispatch, event);
    {
        let mut c = core.borrow_mut();
        if let Some(rec) = c.listeners.get_mut(id.0) {
            rec.machine = Some(machine);
        }
    }
    status
}

/// Routes one readiness event to the affected pollable's chain. Write is
/// dispatched before read; either returning [`Status::Done`] removes the
/// listener after both dispatches.
pub(crate) fn dispatch_ready<T: 'static>(core: &Rc<RefCell<Core<T>>>, token: Token, ready: Interest) {
    let chain: Vec<ListenerId> = {
        let c = core.borrow();
        let Some(pollable) = c.polls.get(Key::from_usize(token.0)) else {
            return;
        };
        let chain = pollable.borrow().chain.clone();
        chain
    };
    for id in chain {
        let wrote = if ready.is_writable() {
            dispatch_event(core, id, EventKind::Write)
        } else {
            Status::NotDone
        };
        let read = if ready.is_readable() {
            dispatch_event(core, id, EventKind::Read)
        } else {
            Status::NotDone
        };
        if wrote == Status::Done || read == Status::Done {
            unlisten(core, id);
        }
    }
}
