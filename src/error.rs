//! Error types and error handling strategy.
//!
//! Errors are explicit and typed. Three disciplines apply throughout the
//! crate:
//!
//! - Contract violations (listening twice for one event, suspending a fiber
//!   that is already waiting, malformed select clauses) unwind the current
//!   fiber as an [`Error`], never the process.
//! - Stale wake-ups are not errors at all; they are dropped silently as the
//!   normal cleanup path of cancellation.
//! - Backend failures carry the underlying [`std::io::Error`] as a source
//!   and terminate the loop that observed them.

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A fiber was cancelled with a caller-supplied message.
    Cancelled,
    /// A deadline registered against the fiber expired.
    Timeout,
    /// An API contract was violated by the caller.
    Contract,
    /// A queue grew past its hard capacity ceiling.
    QueueOverflow,
    /// The OS backend failed to register, deregister, or wait.
    Backend,
    /// Internal runtime error (bug).
    Internal,
}

/// The crate-wide error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attaches a message to the error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The error a fiber observes when an error timeout fires.
    ///
    /// The message is exactly `"timeout"`.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout).with_message("timeout")
    }

    /// A cancellation error carrying the canceller's message.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(message)
    }

    /// A contract violation with a description of the broken rule.
    #[must_use]
    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract).with_message(message)
    }

    /// A queue overflow past the hard capacity ceiling.
    #[must_use]
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueOverflow).with_message(message)
    }

    /// A backend failure wrapping the OS error.
    #[must_use]
    pub fn backend(source: std::io::Error) -> Self {
        Self::new(ErrorKind::Backend).with_source(source)
    }

    /// Returns the attached message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error came from an expired deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error came from cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{msg}"),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for loop operations.
pub type Result<T> = core::result::Result<T, Error>;
