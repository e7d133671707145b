//! Wire behavior for the shout protocol.
//!
//! A client sends up to `buffer_size` bytes; the server uppercases ASCII
//! letters byte-wise and echoes the block back, then closes. No handshake,
//! no length prefix, no delimiter: the message is whatever one read phase
//! drains from the socket.

use crate::config::OversizePolicy;

/// Uppercase ASCII letters in place.
///
/// Non-letter bytes pass through unchanged; the input is arbitrary bytes,
/// not necessarily UTF-8.
pub fn shout(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = b.to_ascii_uppercase();
    }
}

/// Decision for a completed read phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Echo back the first `len` bytes of the buffer.
    Reply { len: usize },
    /// Close the connection without a reply.
    Reject,
}

/// Apply the oversize policy to a completed read.
///
/// A read that fills the buffer to capacity may have left bytes behind in
/// the socket. Under `Reject` that is grounds to drop the connection; under
/// `Truncate` the first `capacity` bytes are the message.
pub fn finish_read(filled: usize, capacity: usize, policy: OversizePolicy) -> ReadOutcome {
    if filled >= capacity && policy == OversizePolicy::Reject {
        ReadOutcome::Reject
    } else {
        ReadOutcome::Reply { len: filled.min(capacity) }
    }
}
