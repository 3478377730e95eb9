//! Backend contract for I/O event multiplexing.
//!
//! The event loop touches the operating system through exactly one seam: a
//! [`Backend`] that manages per-handle interest and blocks for the next
//! readiness event or deadline. Everything else (listener chains, masks,
//! fiber bookkeeping) is backend-independent.
//!
//! Two implementations ship with the crate:
//!
//! | Backend | Module | Purpose |
//! |---------|--------|---------|
//! | [`SysBackend`] | `sys` | Edge-triggered OS readiness (epoll/kqueue) |
//! | [`LabBackend`] | `lab` | Injected readiness for deterministic tests |
//!
//! # Contract
//!
//! - `wait` blocks until a readiness event arrives or the timeout elapses,
//!   whichever is first. `None` blocks indefinitely, `Some(ZERO)` polls.
//! - `wait` restarts on `EINTR`; it never surfaces interrupts to the loop.
//! - Spurious and timeout-only returns are allowed; the loop re-checks its
//!   timers after every wake.
//! - Within one handle, write readiness is dispatched before read readiness.
//!   Callers must not rely on any ordering across handles.

pub mod lab;
pub mod sys;

pub use lab::{LabBackend, LabHandle};
pub use sys::SysBackend;

use crate::listener::Interest;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Identifier linking a registered handle to the events it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token of the registered handle.
    pub token: Token,
    /// Readiness that triggered. Hangup and error conditions are folded
    /// into read readiness so listeners observe them as failing reads.
    pub ready: Interest,
}

/// Reusable container for events returned by [`Backend::wait`].
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Creates a buffer that holds at most `capacity` events per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Clears the buffer, keeping its storage.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Appends an event. Events past the capacity are dropped; the handle
    /// stays ready and surfaces on the next wait.
    pub fn push(&mut self, event: Event) {
        if self.inner.len() < self.capacity {
            self.inner.push(event);
        }
    }

    /// Returns the number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over buffered events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// I/O multiplexing backend.
///
/// Registration is keyed by both the raw handle and a caller-chosen token;
/// the token comes back in every [`Event`] for the handle. The loop keeps
/// one registration per pollable and re-registers with a wider interest set
/// when additional listeners attach.
pub trait Backend {
    /// Registers a handle with an initial interest set.
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Replaces the interest set of a registered handle.
    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Removes a handle's registration.
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until readiness or the timeout, appending events to `events`.
    ///
    /// Returns the number of events appended. A return of zero means the
    /// timeout elapsed or the wake was spurious.
    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;
}
