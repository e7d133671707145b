//! shoutback: a TCP echo server that shouts back.
//!
//! Each client sends up to a fixed-size block of bytes; the server uppercases
//! ASCII letters byte-wise, echoes the block, and closes the connection.
//!
//! The interesting part is the runtime: a single-threaded readiness loop
//! (mio poll) driving an explicit per-connection state machine, with a
//! thread-per-connection variant kept as a contrast baseline.

mod config;
mod protocol;
mod runtime;

use config::{Config, RuntimeType};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        oversize = ?config.oversize,
        runtime = ?config.runtime,
        "Starting shoutback server"
    );

    match config.runtime {
        RuntimeType::Reactor => runtime::run_reactor(&config)?,
        RuntimeType::Threaded => runtime::run_threaded(&config)?,
    }

    Ok(())
}
