//! The transport-specific resource a `Connection` holds. Three realizations: `internal`
//! (in-process peer pairing, no I/O), `stream` (blocking TCP), `datagram` (blocking UDP with an
//! anonymous-adapter stage on the server side). All three are driven through the same
//! `Transport` trait so `Connection` never branches on transport kind.

pub mod datagram;
pub mod internal;
pub mod stream;

use netsupport::NetworkResult;

/// The write half of a connection's transport-specific resource. The read half (feeding bytes
/// into a `ByteAccumulator` and routing the resulting frames to the connection) runs on a
/// dedicated reader thread per connection and is not part of this trait — see
/// `stream::spawn_reader` / `datagram::run_server_loop`.
pub trait Transport: Send {
    /// Writes one already-encoded record. Must not interleave two records from different
    /// callers; `Connection` serializes calls through its own lock before reaching here.
    fn send_record(&mut self, bytes: &[u8]) -> NetworkResult<()>;

    /// Releases the underlying resource. Called exactly once, from `Connection::close`.
    fn close(&mut self);
}

/// A transport that accepts every send and discards it. Used by unit tests that exercise the
/// connection state machine without real I/O.
#[derive(Default)]
pub struct NullTransport {
    closed: bool,
}

impl Transport for NullTransport {
    fn send_record(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        let _ = bytes;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
