//! Edge-triggered OS readiness backend.
//!
//! Built on `mio`, which registers handles edge-triggered with the platform
//! poller (epoll on Linux, kqueue on the BSDs). Edge triggering means a
//! handle only notifies again after a fresh state change, so listener
//! machines must drain reads and writes until the OS reports `WouldBlock`
//! before suspending again.
//!
//! Deadlines are delivered by bounding the blocking wait with the computed
//! timeout rather than by a separate timer handle; a timeout-only wake
//! surfaces as a wait that appended no events.

use super::{Backend, Event, Events, Token};
use crate::listener::Interest;
use mio::unix::SourceFd;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Number of OS events retrieved per wait.
const WAIT_BATCH: usize = 64;

/// Readiness backend over the platform poller.
pub struct SysBackend {
    poll: mio::Poll,
    buffer: mio::Events,
}

impl SysBackend {
    /// Creates the backend, opening the platform poller.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            buffer: mio::Events::with_capacity(WAIT_BATCH),
        })
    }

    fn mio_interest(interest: Interest) -> io::Result<mio::Interest> {
        let readable = interest.is_readable();
        let writable = interest.is_writable();
        match (readable, writable) {
            (true, true) => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Ok(mio::Interest::READABLE),
            (false, true) => Ok(mio::Interest::WRITABLE),
            (false, false) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "registration needs read or write interest",
            )),
        }
    }

    fn ready_of(event: &mio::event::Event) -> Interest {
        let mut ready = Interest::NONE;
        // Hangup and error states surface as read readiness so a listener
        // observes them as a failing read.
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ready = ready.add(Interest::READABLE);
        }
        if event.is_writable() || event.is_write_closed() {
            ready = ready.add(Interest::WRITABLE);
        }
        ready
    }
}

impl Backend for SysBackend {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = Self::mio_interest(interest)?;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), mio::Token(token.0), interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = Self::mio_interest(interest)?;
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), mio::Token(token.0), interest)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        loop {
            match self.poll.poll(&mut self.buffer, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        let mut appended = 0;
        for event in &self.buffer {
            let ready = Self::ready_of(event);
            if ready == Interest::NONE {
                continue;
            }
            events.push(Event {
                token: Token(event.token().0),
                ready,
            });
            appended += 1;
        }
        Ok(appended)
    }
}

impl std::fmt::Debug for SysBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysBackend").finish_non_exhaustive()
    }
}
