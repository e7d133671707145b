//! The single-threaded readiness loop.
//!
//! One thread owns the poller, the listener, and the connection table, and
//! is the only writer to any of them; the only blocking point is
//! `Poller::wait`. Readiness events drive each connection through
//! read -> write -> close, one transition per event.

use crate::config::{Config, OversizePolicy};
use crate::protocol::{self, ReadOutcome};
use crate::runtime::{ConnTable, Connection, Interest, Phase, Poller};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// Largest buffer for which a dry socket is taken as end of message.
///
/// A payload that fits one TCP segment (1460 bytes on a common MTU) is
/// delivered whole, so running dry after the first bytes means the client
/// has sent everything it is going to send. Above this size a dry socket
/// may just be a mid-message stall, and the read phase completes only at
/// capacity or when the peer half-closes; a sub-capacity sender that never
/// half-closes waits indefinitely, consistent with the no-timeout design.
const EAGER_COMPLETE_MAX: usize = 1024;

/// What a state-machine transition decided about the connection's
/// registration.
enum Advance {
    /// Keep the current interest and wait for the next event.
    Keep,
    /// Flip the registration to the given interest.
    Rearm(Interest),
    /// Deregister, remove from the table, and close.
    Done,
}

/// Single-reactor echo server.
pub struct Reactor {
    poller: Poller,
    listener: TcpListener,
    connections: ConnTable,
    buffer_size: usize,
    oversize: OversizePolicy,
}

impl Reactor {
    /// Bind the listening socket and register it with a fresh poller.
    ///
    /// Port 0 is honored, so tests can bind an ephemeral port and read it
    /// back with [`Reactor::local_addr`] before starting the loop.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let mut poller = Poller::new().map_err(io::Error::from)?;
        poller
            .register(&mut listener, LISTENER_TOKEN, Interest::Read)
            .map_err(io::Error::from)?;

        Ok(Self {
            poller,
            listener,
            connections: ConnTable::new(config.max_connections),
            buffer_size: config.buffer_size,
            oversize: config.oversize,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the loop forever.
    ///
    /// Only poller failures escape; a read or write failure closes that one
    /// connection and the loop keeps going.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            buffer_size = self.buffer_size,
            oversize = ?self.oversize,
            "Reactor started"
        );

        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.poller.wait(&mut events, None).map_err(io::Error::from)?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    token => self.connection_ready(token, event),
                }
            }
        }
    }

    /// Drain the accept queue. Each accepted stream enters `AwaitingRead`
    /// and is registered for read-interest.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = Connection::new(stream, self.buffer_size);
                    let Some((token, conn)) = self.connections.insert(conn) else {
                        // Dropping the stream closes it.
                        warn!(peer = %peer, "Connection limit reached, dropping");
                        continue;
                    };
                    if let Err(e) = self.poller.register(&mut conn.stream, token, Interest::Read) {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(token);
                        continue;
                    }
                    debug!(token = token.0, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Advance one connection by exactly one state-machine transition.
    fn connection_ready(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.connections.get_mut(token) else {
            // A completed connection can leave an already-queued event
            // behind in the same poll batch. The id check in the table makes
            // that a detectable stale token instead of another connection's
            // state.
            debug!(token = token.0, "Stale readiness event");
            return;
        };

        if !event_matches_phase(conn.phase, event.is_readable(), event.is_writable()) {
            // An error-only event, or a direction the phase is not armed
            // for: the registration cannot make progress, and keeping it
            // would park the connection forever under edge triggering.
            warn!(token = token.0, phase = ?conn.phase, "Unusable readiness event, closing");
            self.close(token);
            return;
        }

        let oversize = self.oversize;
        let advance = match conn.phase {
            Phase::AwaitingRead { filled } => advance_read(conn, filled, oversize),
            Phase::AwaitingWrite { written, total } => advance_write(conn, written, total),
        };

        match advance {
            Ok(Advance::Keep) => {}
            Ok(Advance::Rearm(interest)) => {
                if let Err(e) = self.poller.modify(&mut conn.stream, token, interest) {
                    error!(token = token.0, error = %e, "Failed to rearm connection");
                    self.close(token);
                }
            }
            Ok(Advance::Done) => self.close(token),
            Err(e) => {
                debug!(token = token.0, error = %e, "Connection error");
                self.close(token);
            }
        }
    }

    /// Deregister, drop the table entry, and close the descriptor.
    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(token) {
            if let Err(e) = self.poller.deregister(&mut conn.stream, token) {
                debug!(token = token.0, error = %e, "Deregister failed");
            }
            debug!(token = token.0, live = self.connections.len(), "Connection closed");
        }
    }
}

/// A registration only ever waits on the direction its phase needs, so a
/// usable event must carry that direction.
fn event_matches_phase(phase: Phase, readable: bool, writable: bool) -> bool {
    match phase {
        Phase::AwaitingRead { .. } => readable,
        Phase::AwaitingWrite { .. } => writable,
    }
}

/// One read-ready event: drain the socket into the buffer.
///
/// The payload is complete when the buffer is full or the peer half-closes.
/// For buffers up to [`EAGER_COMPLETE_MAX`] a dry socket also completes the
/// payload (see the constant's notes); beyond that the cursor is saved and
/// the connection stays armed for read. `WouldBlock` with an empty buffer
/// is a spurious wakeup either way.
fn advance_read(
    conn: &mut Connection,
    mut filled: usize,
    policy: OversizePolicy,
) -> io::Result<Advance> {
    let capacity = conn.buf.len();
    let mut eof = false;

    while filled < capacity {
        match conn.stream.read(&mut conn.buf[filled..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    if filled == 0 {
        if eof {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer closed before sending",
            ));
        }
        return Ok(Advance::Keep);
    }

    if filled < capacity && !eof && capacity > EAGER_COMPLETE_MAX {
        // Mid-message stall: keep reading on the next readiness event.
        conn.phase = Phase::AwaitingRead { filled };
        return Ok(Advance::Keep);
    }

    if filled == capacity && policy == OversizePolicy::Truncate {
        // Discard whatever else is already queued so the eventual close is
        // a clean FIN rather than a reset racing the reply.
        discard_excess(conn)?;
    }

    match protocol::finish_read(filled, capacity, policy) {
        ReadOutcome::Reject => {
            debug!(filled, capacity, "Rejecting payload that filled the buffer");
            Ok(Advance::Done)
        }
        ReadOutcome::Reply { len } => {
            debug!(payload = %String::from_utf8_lossy(&conn.buf[..len]), "received");
            protocol::shout(&mut conn.buf[..len]);
            conn.start_writing(len);
            Ok(Advance::Rearm(Interest::Write))
        }
    }
}

/// Read and discard queued bytes beyond the buffer until the socket runs
/// dry or the peer closes.
fn discard_excess(conn: &mut Connection) -> io::Result<()> {
    let mut scratch = [0u8; 512];
    loop {
        match conn.stream.read(&mut scratch) {
            Ok(0) => return Ok(()),
            Ok(n) => debug!(discarded = n, "Discarding bytes beyond buffer capacity"),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// One write-ready event: push out as much of the reply as the socket
/// accepts. The connection is done once the reply is fully drained.
fn advance_write(conn: &mut Connection, mut written: usize, total: usize) -> io::Result<Advance> {
    while written < total {
        match conn.stream.write(&conn.buf[written..total]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.phase = Phase::AwaitingWrite { written, total };
                return Ok(Advance::Keep);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Advance::Done)
}

/// Build the non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeType;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn test_config(buffer_size: usize, oversize: OversizePolicy) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            buffer_size,
            max_connections: 32,
            oversize,
            runtime: RuntimeType::Reactor,
            log_level: "info".to_string(),
        }
    }

    /// Bind on an ephemeral port and run the reactor on a background
    /// thread. The thread lives until the test process exits.
    fn spawn_reactor(config: Config) -> SocketAddr {
        let reactor = Reactor::bind(&config).unwrap();
        let addr = reactor.local_addr().unwrap();
        thread::spawn(move || {
            let _ = reactor.run();
        });
        addr
    }

    fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(payload).unwrap();
        let mut reply = Vec::new();
        // The server closes after echoing, so read runs to EOF.
        stream.read_to_end(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_shouts_back_hello_world() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));
        assert_eq!(roundtrip(addr, b"hello world!!!!"), b"HELLO WORLD!!!!");
    }

    #[test]
    fn test_non_letter_bytes_pass_through() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));
        assert_eq!(roundtrip(addr, b"a1!B2@c3#"), b"A1!B2@C3#");
    }

    #[test]
    fn test_oversized_payload_is_truncated() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));
        let reply = roundtrip(addr, b"twenty bytes long!!!");
        assert_eq!(reply, b"TWENTY BYTES LON");
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Reject));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"twenty bytes long!!!").unwrap();

        // The server closes without replying; depending on timing the
        // client sees a clean EOF or a reset, never an uppercased echo.
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        assert!(reply.is_empty());
    }

    #[test]
    fn test_concurrent_clients_get_their_own_reply() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let payload = format!("client {i} here");
                    let reply = roundtrip(addr, payload.as_bytes());
                    assert_eq!(reply, payload.to_ascii_uppercase().into_bytes());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_idle_clients_complete_in_any_order() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));

        // Both connections are accepted before either sends a byte.
        let mut first = TcpStream::connect(addr).unwrap();
        let mut second = TcpStream::connect(addr).unwrap();
        first
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        // Drive the later connection to completion first.
        second.write_all(b"second").unwrap();
        let mut reply = Vec::new();
        second.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"SECOND");

        first.write_all(b"first").unwrap();
        let mut reply = Vec::new();
        first.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"FIRST");
    }

    #[test]
    fn test_event_must_match_phase() {
        assert!(event_matches_phase(Phase::AwaitingRead { filled: 0 }, true, false));
        assert!(!event_matches_phase(Phase::AwaitingRead { filled: 0 }, false, true));
        assert!(!event_matches_phase(Phase::AwaitingRead { filled: 0 }, false, false));

        let writing = Phase::AwaitingWrite { written: 0, total: 4 };
        assert!(event_matches_phase(writing, false, true));
        assert!(!event_matches_phase(writing, true, false));
        assert!(!event_matches_phase(writing, false, false));
    }

    #[test]
    fn test_large_payload_spans_multiple_read_and_write_events() {
        // A megabyte exceeds the socket buffers in both directions, so the
        // read phase must resume across readiness events instead of
        // declaring the first drained prefix complete, and the reply must
        // resume across partial writes.
        const SIZE: usize = 1 << 20;
        let addr = spawn_reactor(test_config(SIZE, OversizePolicy::Truncate));

        let payload: Vec<u8> = (0..SIZE).map(|i| b'a' + (i % 26) as u8).collect();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .unwrap();
        stream.write_all(&payload).unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        let expected: Vec<u8> = payload.iter().map(|b| b.to_ascii_uppercase()).collect();
        assert_eq!(reply.len(), SIZE);
        assert_eq!(reply, expected);
    }

    #[test]
    fn test_large_buffer_waits_for_half_close() {
        let addr = spawn_reactor(test_config(1 << 20, OversizePolicy::Truncate));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"hello under capacity").unwrap();
        // With a buffer this large a dry socket may be a mid-message
        // stall, so the reply comes only once the client half-closes.
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"HELLO UNDER CAPACITY");
    }

    #[test]
    fn test_half_close_without_payload_closes_quietly() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        // The server closes without replying.
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());

        // And stays healthy for the next client.
        assert_eq!(roundtrip(addr, b"still here"), b"STILL HERE");
    }

    #[test]
    fn test_many_sequential_connections_reuse_slots_cleanly() {
        let addr = spawn_reactor(test_config(16, OversizePolicy::Truncate));

        // Far more connections than table slots, so slab slots (and likely
        // OS descriptor numbers) get reused; every reply must still match
        // its own payload.
        for i in 0..100 {
            let payload = format!("msg {i:03}");
            let reply = roundtrip(addr, payload.as_bytes());
            assert_eq!(reply, payload.to_ascii_uppercase().into_bytes());
        }
    }
}
