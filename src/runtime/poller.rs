//! Readiness multiplexer wrapped around `mio::Poll`.
//!
//! The wrapper adds two things the raw backend does not give us:
//! - single-direction interests: the protocol is strictly half duplex, so a
//!   registration is read-interest XOR write-interest, never both. The
//!   two-variant [`Interest`] enum makes a combined interest unrepresentable.
//! - deterministic registration errors: registered tokens are tracked here,
//!   so double-register and modify/deregister-when-absent fail the same way
//!   on every platform instead of surfacing backend-specific errno values.

use mio::event::Source;
use mio::{Events, Poll, Token};
use std::collections::HashSet;
use std::io;
use std::time::Duration;

/// Which direction a registration waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Read => mio::Interest::READABLE,
            Interest::Write => mio::Interest::WRITABLE,
        }
    }
}

/// Errors from multiplexer operations.
#[derive(Debug)]
pub enum PollerError {
    /// The OS could not allocate the polling facility.
    ResourceExhausted(io::Error),
    /// `register` was called for a token that is already tracked.
    AlreadyRegistered(Token),
    /// `modify` or `deregister` was called for a token that is not tracked.
    NotRegistered(Token),
    /// Any other backend failure.
    Io(io::Error),
}

impl std::fmt::Display for PollerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerError::ResourceExhausted(e) => {
                write!(f, "Failed to allocate polling facility: {}", e)
            }
            PollerError::AlreadyRegistered(t) => {
                write!(f, "Token {} is already registered", t.0)
            }
            PollerError::NotRegistered(t) => write!(f, "Token {} is not registered", t.0),
            PollerError::Io(e) => write!(f, "Poller I/O error: {}", e),
        }
    }
}

impl std::error::Error for PollerError {}

impl From<PollerError> for io::Error {
    fn from(e: PollerError) -> Self {
        match e {
            PollerError::ResourceExhausted(e) | PollerError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Blocks until one or more registered descriptors become ready.
pub struct Poller {
    poll: Poll,
    registered: HashSet<Token>,
}

impl Poller {
    /// Allocate the OS polling facility.
    pub fn new() -> Result<Self, PollerError> {
        let poll = Poll::new().map_err(PollerError::ResourceExhausted)?;
        Ok(Self {
            poll,
            registered: HashSet::new(),
        })
    }

    /// Add a descriptor with an opaque token and a single-direction interest.
    pub fn register<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), PollerError> {
        if self.registered.contains(&token) {
            return Err(PollerError::AlreadyRegistered(token));
        }
        self.poll
            .registry()
            .register(source, token, interest.to_mio())
            .map_err(PollerError::Io)?;
        self.registered.insert(token);
        Ok(())
    }

    /// Atomically replace a registration's interest.
    ///
    /// This is how a connection flips from "wants to read" to "wants to
    /// write" without being removed and re-added.
    pub fn modify<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), PollerError> {
        if !self.registered.contains(&token) {
            return Err(PollerError::NotRegistered(token));
        }
        self.poll
            .registry()
            .reregister(source, token, interest.to_mio())
            .map_err(PollerError::Io)
    }

    /// Remove a descriptor's registration. Calling twice for the same token
    /// fails with `NotRegistered`.
    pub fn deregister<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> Result<(), PollerError> {
        if !self.registered.remove(&token) {
            return Err(PollerError::NotRegistered(token));
        }
        self.poll
            .registry()
            .deregister(source)
            .map_err(PollerError::Io)
    }

    /// Block until at least one registered descriptor is ready, or the
    /// timeout elapses. The reactor passes `None` (no deadline).
    pub fn wait(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> Result<(), PollerError> {
        self.poll.poll(events, timeout).map_err(PollerError::Io)
    }
}
