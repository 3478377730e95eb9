//! Deterministic backend for tests.
//!
//! Instead of touching the OS, the lab backend delivers readiness events
//! injected by the test through a [`LabHandle`]. Events are delivered in
//! injection order on the next wait, and events for handles that are not
//! currently registered are discarded. Handles are identified by their raw
//! fd value, which the lab never opens or closes, so tests may use any
//! integers they like.

use super::{Backend, Event, Events, Token};
use crate::listener::Interest;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
struct LabState {
    registered: HashMap<RawFd, Token>,
    pending: VecDeque<(RawFd, Interest)>,
}

/// Injected-events backend.
#[derive(Debug)]
pub struct LabBackend {
    shared: Rc<RefCell<LabState>>,
}

/// Test-side handle for injecting readiness into a [`LabBackend`].
#[derive(Debug, Clone)]
pub struct LabHandle {
    shared: Rc<RefCell<LabState>>,
}

impl LabBackend {
    /// Creates a backend and the handle that injects events into it.
    #[must_use]
    pub fn new() -> (Self, LabHandle) {
        let shared = Rc::new(RefCell::new(LabState::default()));
        (
            Self {
                shared: Rc::clone(&shared),
            },
            LabHandle { shared },
        )
    }
}

impl LabHandle {
    /// Queues readiness for a handle. Delivered on the next wait if the
    /// handle is registered at that point, dropped otherwise.
    pub fn inject(&self, fd: RawFd, ready: Interest) {
        self.shared.borrow_mut().pending.push_back((fd, ready));
    }

    /// Returns the number of currently registered handles.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.borrow().registered.len()
    }
}

impl Backend for LabBackend {
    fn add(&mut self, fd: RawFd, token: Token, _interest: Interest) -> io::Result<()> {
        let mut state = self.shared.borrow_mut();
        if state.registered.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "handle already registered",
            ));
        }
        state.registered.insert(fd, token);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, _interest: Interest) -> io::Result<()> {
        let mut state = self.shared.borrow_mut();
        match state.registered.get_mut(&fd) {
            Some(slot) => {
                *slot = token;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "handle not registered",
            )),
        }
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        if self.shared.borrow_mut().registered.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "handle not registered",
            ));
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let mut appended = 0;
        {
            let mut state = self.shared.borrow_mut();
            while let Some((fd, ready)) = state.pending.pop_front() {
                if let Some(&token) = state.registered.get(&fd) {
                    events.push(Event { token, ready });
                    appended += 1;
                }
            }
        }
        if appended == 0 {
            // Nothing injected. Honor the deadline so timer-driven tests
            // observe real elapsed time, and yield instead of spinning when
            // the caller would block forever.
            match timeout {
                Some(t) => std::thread::sleep(t.min(Duration::from_millis(50))),
                None => std::thread::yield_now(),
            }
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_injected_events_in_order() {
        let (mut backend, handle) = LabBackend::new();
        backend.add(3, Token(30), Interest::READABLE).unwrap();
        backend.add(4, Token(40), Interest::WRITABLE).unwrap();

        handle.inject(4, Interest::WRITABLE);
        handle.inject(3, Interest::READABLE);

        let mut events = Events::with_capacity(8);
        let n = backend.wait(&mut events, None).unwrap();
        assert_eq!(n, 2);
        let tokens: Vec<usize> = events.iter().map(|e| e.token.0).collect();
        assert_eq!(tokens, vec![40, 30]);
    }

    #[test]
    fn unregistered_events_are_dropped() {
        let (mut backend, handle) = LabBackend::new();
        handle.inject(9, Interest::READABLE);
        let mut events = Events::with_capacity(8);
        let n = backend
            .wait(&mut events, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn duplicate_add_fails() {
        let (mut backend, handle) = LabBackend::new();
        backend.add(5, Token(1), Interest::READABLE).unwrap();
        let err = backend.add(5, Token(2), Interest::READABLE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(handle.registered_count(), 1);
        backend.delete(5).unwrap();
        assert_eq!(handle.registered_count(), 0);
    }

    #[test]
    fn delete_unknown_fails() {
        let (mut backend, _handle) = LabBackend::new();
        let err = backend.delete(11).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
