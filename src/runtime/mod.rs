//! Connection-driving runtimes.
//!
//! Two variants share the wire behavior in `crate::protocol`:
//! - `reactor`: a single-threaded readiness loop (epoll on Linux, kqueue on
//!   macOS, via mio) with an explicit per-connection state machine. This is
//!   the core.
//! - `threaded`: one blocking OS thread per connection, kept as the contrast
//!   baseline the reactor replaces.

mod connection;
mod poller;
mod reactor;
mod threaded;

pub(crate) use connection::{ConnTable, Connection, Phase};
pub(crate) use poller::{Interest, Poller};

use crate::config::Config;
use std::io;

/// Run the readiness-based reactor runtime.
pub fn run_reactor(config: &Config) -> io::Result<()> {
    let reactor = reactor::Reactor::bind(config)?;
    reactor.run()
}

/// Run the thread-per-connection baseline.
pub fn run_threaded(config: &Config) -> io::Result<()> {
    threaded::run(config)
}
