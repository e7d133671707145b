//! Per-connection state machine and the table that owns it.
//!
//! A connection moves strictly read -> write -> closed. There is no stored
//! `Closed` state: a finished connection is removed from the table, which
//! drops the stream and closes the descriptor.

use mio::net::TcpStream;
use mio::Token;
use slab::Slab;

/// Where a connection is in the read-then-write protocol.
#[derive(Debug, Clone, Copy)]
pub enum Phase {
    /// Waiting for the client's payload. `filled` tracks bytes read so far;
    /// one readiness event is not assumed to deliver the whole payload.
    AwaitingRead { filled: usize },
    /// Waiting to drain the uppercased reply. Partial writes stay here.
    AwaitingWrite { written: usize, total: usize },
}

/// One accepted client link.
///
/// Exclusively owns its stream; dropping the connection closes the
/// descriptor.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub buf: Vec<u8>,
    pub phase: Phase,
}

impl Connection {
    pub fn new(stream: TcpStream, buffer_size: usize) -> Self {
        Self {
            stream,
            buf: vec![0; buffer_size],
            phase: Phase::AwaitingRead { filled: 0 },
        }
    }

    /// Flip to the write phase for a `total`-byte reply.
    pub fn start_writing(&mut self, total: usize) {
        self.phase = Phase::AwaitingWrite { written: 0, total };
    }
}

// Low bits of a token address a slab slot; the remaining bits carry a
// monotonic connection id so a token can never alias a later occupant of
// the same slot.
const SLOT_BITS: u32 = 16;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;
const ID_MASK: usize = usize::MAX >> SLOT_BITS;

/// Largest table the token layout can address. Slot indexes stay strictly
/// below this, so `Token(usize::MAX)` remains free for the listener.
pub const MAX_CONNECTIONS_CAP: usize = SLOT_MASK;

/// Table of live connections, keyed by the tokens it mints.
pub struct ConnTable {
    slots: Slab<(usize, Connection)>,
    next_id: usize,
    max_connections: usize,
}

impl ConnTable {
    pub fn new(max_connections: usize) -> Self {
        let max = max_connections.min(MAX_CONNECTIONS_CAP);
        Self {
            slots: Slab::with_capacity(max),
            next_id: 0,
            max_connections: max,
        }
    }

    /// Insert a connection and mint its token. Returns `None` at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<(Token, &mut Connection)> {
        if self.slots.len() >= self.max_connections {
            return None;
        }
        let id = self.next_id;
        self.next_id = (self.next_id + 1) & ID_MASK;
        let slot = self.slots.insert((id, conn));
        let token = Token((id << SLOT_BITS) | slot);
        self.slots.get_mut(slot).map(|(_, conn)| (token, conn))
    }

    /// Resolve a token to its connection.
    ///
    /// Returns `None` when the token is stale: the slot is empty or has been
    /// reused by a connection with a different id.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        let (id, slot) = unpack(token);
        match self.slots.get_mut(slot) {
            Some((stored, conn)) if *stored == id => Some(conn),
            _ => None,
        }
    }

    /// Remove a connection, returning it so the caller can deregister the
    /// stream before it is dropped. Stale tokens return `None`.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let (id, slot) = unpack(token);
        match self.slots.get(slot) {
            Some((stored, _)) if *stored == id => Some(self.slots.remove(slot).1),
            _ => None,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

fn unpack(token: Token) -> (usize, usize) {
    (token.0 >> SLOT_BITS, token.0 & SLOT_MASK)
}
