//! Thread-per-connection baseline.
//!
//! The contrast case for the reactor: every connection gets its own blocking
//! OS thread, so descriptor count turns into thread and stack overhead
//! instead of table entries. Kept deliberately naive: one blocking read, one
//! blocking write, close.

use crate::config::{Config, OversizePolicy};
use crate::protocol::{self, ReadOutcome};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, error, info};

pub fn run(config: &Config) -> io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    info!(
        addr = %listener.local_addr()?,
        buffer_size = config.buffer_size,
        "Threaded baseline started"
    );
    serve_listener(listener, config.buffer_size, config.oversize)
}

fn serve_listener(
    listener: TcpListener,
    buffer_size: usize,
    oversize: OversizePolicy,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                thread::spawn(move || {
                    if let Err(e) = serve(stream, buffer_size, oversize) {
                        debug!(error = %e, "Connection error");
                    }
                });
            }
            Err(e) => error!(error = %e, "Accept error"),
        }
    }
}

/// Serve one connection to completion; dropping the stream closes it.
fn serve(mut stream: TcpStream, buffer_size: usize, oversize: OversizePolicy) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Ok(());
    }

    match protocol::finish_read(n, buffer_size, oversize) {
        ReadOutcome::Reject => Ok(()),
        ReadOutcome::Reply { len } => {
            debug!(payload = %String::from_utf8_lossy(&buf[..len]), "received");
            protocol::shout(&mut buf[..len]);
            stream.write_all(&buf[..len])
        }
    }
}
