//! Fiberloop: a cooperative, single-threaded event loop for embedding.
//!
//! # Overview
//!
//! Fiberloop multiplexes three things onto one OS event source: lightweight
//! fibers that suspend and later resume with a value or an error, timed
//! wake-ups with millisecond resolution, and I/O readiness notifications for
//! raw OS handles. On top of the scheduler sits a bounded channel with
//! blocking send/receive and a multi-clause select.
//!
//! # Core Guarantees
//!
//! - **Strictly cooperative**: one thread drives everything; there are no
//!   locks because there is no sharing. Loops on different threads are fully
//!   independent.
//! - **FIFO run queue**: fibers resume in the order they were scheduled, and
//!   a fiber is never queued twice.
//! - **Epoch-based cancellation**: every queued wake-up carries the fiber's
//!   scheduling epoch at registration; stale wake-ups are dropped at dispatch
//!   instead of being removed eagerly.
//! - **Single outstanding wait**: a fiber blocks on at most one timer,
//!   listener, or channel waiter at a time, and its wait is torn down when it
//!   is resumed by any other path.
//!
//! # Module Structure
//!
//! - [`ev`]: the event loop, fiber table, and scheduling API
//! - [`cx`]: the capability handle fibers use to sleep, listen, and exchange
//!   channel values
//! - [`chan`]: bounded channels with send, receive, and select
//! - [`listener`]: pollables and listener state machines
//! - [`poll`]: the backend contract and its system/lab implementations
//! - [`ring`]: the grow-on-full circular queue backing every internal queue
//! - [`timer`]: the timeout min-heap and millisecond clock
//! - [`error`]: error types
//! - [`util`]: generational slab and deterministic RNG

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod chan;
pub mod cx;
pub mod error;
pub mod ev;
pub mod listener;
pub mod poll;
pub mod ring;
pub mod test_utils;
pub mod timer;
pub mod util;

mod task;

pub use chan::{Channel, Clause, SelectOutcome};
pub use cx::Cx;
pub use error::{Error, ErrorKind, Result};
pub use ev::{EvLoop, FiberId};
pub use listener::{Dispatch, EventKind, Interest, ListenerId, Machine, Pollable, Status};
pub use poll::{Backend, Event, Events, LabBackend, LabHandle, SysBackend, Token};
