//! Bounded channels with blocking send/receive and multi-clause select.
//!
//! A channel owns three queues: buffered items, pending readers, and pending
//! writers. Waiters carry the scheduling epoch of their fiber; an entry
//! whose epoch no longer matches is stale and is skipped silently, which is
//! how wake-ups queued by an abandoned operation disappear.
//!
//! Send semantics: a value is always deposited (handed to a live reader or
//! buffered), and the sender blocks only when the buffer has grown past the
//! channel's limit. A limit of zero therefore admits one in-flight value
//! before the sender suspends; this is the intended near-rendezvous
//! behavior, not an off-by-one.

use crate::error::{Error, ErrorKind, Result};
use crate::ev::{Core, FiberId};
use crate::ring::Ring;
use crate::task::Wake;
use std::cell::RefCell;
use std::rc::Rc;

/// How a waiter expects its wake-up to be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// A plain item (reader) or a bare resumption (writer).
    Item,
    /// A select read clause; resumed with the take outcome.
    ChoiceRead,
    /// A select write clause; resumed with the give outcome.
    ChoiceWrite,
}

/// A fiber parked on a channel queue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub fiber: FiberId,
    pub sched_id: u32,
    pub mode: Mode,
}

/// Whether a push completed or left the sender blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// The value reached a reader or fit the buffer.
    Delivered,
    /// The value was buffered past the limit; the sender is now queued.
    Blocked,
}

struct ChanState<T> {
    items: Ring<T>,
    read_pending: Ring<Waiter>,
    write_pending: Ring<Waiter>,
    limit: usize,
}

/// A bounded channel owned by one event loop.
///
/// Cloning yields another handle to the same channel. Channels must not be
/// shared across loops; every queue they touch belongs to the loop whose
/// fibers use them.
pub struct Channel<T> {
    state: Rc<RefCell<ChanState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> PartialEq for Channel<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Channel")
            .field("len", &state.items.len())
            .field("limit", &state.limit)
            .field("pending_readers", &state.read_pending.len())
            .field("pending_writers", &state.write_pending.len())
            .finish()
    }
}

impl<T: 'static> Channel<T> {
    /// Creates a channel that blocks senders once more than `limit` items
    /// are buffered.
    #[must_use]
    pub fn bounded(limit: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChanState {
                items: Ring::new(),
                read_pending: Ring::new(),
                write_pending: Ring::new(),
                limit,
            })),
        }
    }

    /// A channel with limit zero: one value may be in flight before the
    /// sender suspends.
    #[must_use]
    pub fn rendezvous() -> Self {
        Self::bounded(0)
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.borrow().items.is_empty()
    }

    /// The configured limit.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.borrow().limit
    }

    /// Returns true once the buffer has reached the limit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        let state = self.state.borrow();
        state.items.len() >= state.limit
    }

    /// Number of queued reader entries, stale ones included.
    #[must_use]
    pub fn pending_readers(&self) -> usize {
        self.state.borrow().read_pending.len()
    }

    /// Number of queued writer entries, stale ones included.
    #[must_use]
    pub fn pending_writers(&self) -> usize {
        self.state.borrow().write_pending.len()
    }

    /// Deposits a value. A live pending reader receives it directly and is
    /// scheduled; otherwise the value is buffered and, past the limit, the
    /// sending fiber is queued as a writer.
    pub(crate) fn push(
        &self,
        core: &mut Core<T>,
        fiber: FiberId,
        value: T,
        is_choice: bool,
    ) -> Result<PushOutcome> {
        let reader = {
            let mut state = self.state.borrow_mut();
            loop {
                match state.read_pending.pop() {
                    None => break None,
                    Some(w) if core.is_current(w.fiber, w.sched_id) => break Some(w),
                    Some(_) => {} // stale reader, dropped
                }
            }
        };
        if let Some(reader) = reader {
            match reader.mode {
                Mode::ChoiceRead => core.schedule(
                    reader.fiber,
                    Wake::Selected(SelectOutcome::Take(self.clone(), value)),
                ),
                _ => core.schedule(reader.fiber, Wake::Item(value)),
            }
            return Ok(PushOutcome::Delivered);
        }

        let mut state = self.state.borrow_mut();
        if state.items.push(value).is_err() {
            return Err(Error::overflow("channel overflow"));
        }
        if state.items.len() > state.limit {
            let sched_id = core
                .sched_id_of(fiber)
                .ok_or_else(|| Error::contract("sending fiber is gone"))?;
            let mode = if is_choice { Mode::ChoiceWrite } else { Mode::Item };
            state
                .write_pending
                .push(Waiter {
                    fiber,
                    sched_id,
                    mode,
                })
                .map_err(|_| Error::overflow("channel writer queue overflow"))?;
            Ok(PushOutcome::Blocked)
        } else {
            Ok(PushOutcome::Delivered)
        }
    }

    /// Removes a buffered item, also surfacing the oldest live writer so the
    /// caller can release it. With nothing buffered the calling fiber is
    /// queued as a reader and `None` is returned.
    pub(crate) fn pop(
        &self,
        core: &mut Core<T>,
        fiber: FiberId,
        is_choice: bool,
    ) -> Result<Option<(T, Option<Waiter>)>> {
        let mut state = self.state.borrow_mut();
        match state.items.pop() {
            None => {
                let sched_id = core
                    .sched_id_of(fiber)
                    .ok_or_else(|| Error::contract("receiving fiber is gone"))?;
                let mode = if is_choice { Mode::ChoiceRead } else { Mode::Item };
                state
                    .read_pending
                    .push(Waiter {
                        fiber,
                        sched_id,
                        mode,
                    })
                    .map_err(|_| Error::overflow("channel reader queue overflow"))?;
                Ok(None)
            }
            Some(value) => {
                let writer = loop {
                    match state.write_pending.pop() {
                        None => break None,
                        Some(w) if core.is_current(w.fiber, w.sched_id) => break Some(w),
                        Some(_) => {} // stale writer, dropped
                    }
                };
                Ok(Some((value, writer)))
            }
        }
    }

    /// Schedules a writer that a pop released.
    pub(crate) fn wake_writer(&self, core: &mut Core<T>, writer: Waiter) {
        match writer.mode {
            Mode::ChoiceWrite => core.schedule(
                writer.fiber,
                Wake::Selected(SelectOutcome::Give(self.clone())),
            ),
            _ => core.schedule(writer.fiber, Wake::Nil),
        }
    }

    /// Returns true if a give on this channel would complete right now:
    /// either the buffer is below the limit or a live reader is waiting.
    /// Stale readers found at the head of the queue are pruned on the way.
    pub(crate) fn ready_for_give(&self, core: &Core<T>) -> bool {
        let mut state = self.state.borrow_mut();
        if state.items.len() < state.limit {
            return true;
        }
        loop {
            match state.read_pending.peek().copied() {
                None => return false,
                Some(w) if core.is_current(w.fiber, w.sched_id) => return true,
                Some(_) => {
                    state.read_pending.pop();
                }
            }
        }
    }
}

/// One arm of a select.
pub enum Clause<T> {
    /// Receive from the channel.
    Take(Channel<T>),
    /// Send the value to the channel.
    Give(Channel<T>, T),
}

/// The operation a select completed with.
pub enum SelectOutcome<T> {
    /// A send clause completed on this channel.
    Give(Channel<T>),
    /// A receive clause completed on this channel with this value.
    Take(Channel<T>, T),
}

impl<T: PartialEq> PartialEq for SelectOutcome<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Give(a), Self::Give(b)) => a == b,
            (Self::Take(a, x), Self::Take(b, y)) => a == b && x == y,
            _ => false,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SelectOutcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Give(chan) => f.debug_tuple("Give").field(chan).finish(),
            Self::Take(chan, value) => f.debug_tuple("Take").field(chan).field(value).finish(),
        }
    }
}

/// Result of starting a select: either a clause fired immediately or the
/// fiber is registered on every clause and must wait.
pub(crate) enum SelectBegin<T> {
    Fired(SelectOutcome<T>),
    Registered,
}

/// Runs the two-pass select protocol.
///
/// First pass: clauses are tried in positional order and the first that can
/// complete without blocking fires immediately. Second pass: the fiber
/// registers as a choice waiter on every clause and suspends; the first
/// counterparty to act delivers the outcome, and the remaining
/// registrations go stale with the fiber's next scheduling epoch. Values
/// carried by unfired give clauses stay deposited in their channels.
pub(crate) fn select_begin<T: 'static>(
    core: &mut Core<T>,
    fiber: FiberId,
    mut clauses: Vec<Clause<T>>,
) -> Result<SelectBegin<T>> {
    if clauses.is_empty() {
        return Err(Error::contract("select needs at least one clause"));
    }

    let ready_ix = clauses.iter().position(|clause| match clause {
        Clause::Take(chan) => !chan.is_empty(),
        Clause::Give(chan, _) => chan.ready_for_give(core),
    });

    if let Some(ix) = ready_ix {
        return match clauses.swap_remove(ix) {
            Clause::Take(chan) => match chan.pop(core, fiber, true)? {
                Some((value, writer)) => {
                    if let Some(w) = writer {
                        chan.wake_writer(core, w);
                    }
                    Ok(SelectBegin::Fired(SelectOutcome::Take(chan, value)))
                }
                None => Err(Error::new(ErrorKind::Internal)
                    .with_message("ready take clause had no item")),
            },
            Clause::Give(chan, value) => match chan.push(core, fiber, value, true)? {
                PushOutcome::Delivered => Ok(SelectBegin::Fired(SelectOutcome::Give(chan))),
                PushOutcome::Blocked => Err(Error::new(ErrorKind::Internal)
                    .with_message("ready give clause blocked")),
            },
        };
    }

    for clause in clauses {
        match clause {
            Clause::Take(chan) => match chan.pop(core, fiber, true)? {
                None => {}
                Some((value, writer)) => {
                    // A clause became completable while registering (a give
                    // earlier in this pass may feed a later take on the same
                    // channel). Deliver through the resume path and stop
                    // registering; earlier registrations are already stale.
                    core.schedule(
                        fiber,
                        Wake::Selected(SelectOutcome::Take(chan.clone(), value)),
                    );
                    if let Some(w) = writer {
                        chan.wake_writer(core, w);
                    }
                    break;
                }
            },
            Clause::Give(chan, value) => match chan.push(core, fiber, value, true)? {
                PushOutcome::Blocked => {}
                PushOutcome::Delivered => {
                    core.schedule(fiber, Wake::Selected(SelectOutcome::Give(chan)));
                    break;
                }
            },
        }
    }
    Ok(SelectBegin::Registered)
}
