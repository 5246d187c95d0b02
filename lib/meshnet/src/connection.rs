//! The connection lifecycle state machine and its ping tracker. One `Connection` exists per
//! peer, regardless of which transport backs it; transport-specific behavior is confined to
//! the `Transport` trait object it holds (see `transport`).

use crate::coder_pool::CoderPool;
use crate::events::Event;
use crate::network_id::NetworkId;
use crate::packet::Packet;
use crate::transport::Transport;
use crate::wire::frame::{encode_packet, ControlRecord};
use netsupport::logging::{self, debug, warn, Logger};
use netsupport::time::clock_ms;
use std::any::Any;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// `Initialized → Opening → Open ⇄ Checking → Closing → Closed`. `Closed` is absorbing;
/// `Closing` is absorbing except into `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Opening,
    Open,
    Checking,
    Closing,
    Closed,
}

/// Why a connection transitioned to `Closed`. Distinct from `NetworkError`: a close reason is
/// a terminal classification attached to the `ConnectionClosed` event, not a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IoException,
    External,
    Interrupted,
    Remote,
    Timeout,
    Server,
    Expected,
    /// A framing error with no resync boundary (e.g. a negative length field). Not named in
    /// the original close-reason enumeration; added because `ByteAccumulator` can fail in a
    /// way none of the transport-level reasons describe.
    Protocol,
    Unknown,
}

/// Callbacks a `Connection` needs from its owning manager. Kept as a trait so `connection.rs`
/// does not depend on `manager.rs` directly; `ManagerCore` implements this.
pub trait ConnectionHost: Send + Sync {
    fn dispatch_packet(&self, source: &NetworkId, packet: Box<dyn Packet>, custom_object: &Arc<CustomObjectSlot>);
    fn post_event(&self, event: Event);
    fn remove_silently(&self, id: &NetworkId);
    fn log(&self) -> &Logger;
}

/// A user-attachable object a `ConfigureConnection` handler may attach to a newly accepted
/// connection, exposed to packet handlers as part of the dispatch context. Empty for
/// connections no `ConfigureConnection` handler ever touches (every client-side connection,
/// and any server-side connection no handler chooses to annotate).
#[derive(Default)]
pub struct CustomObjectSlot {
    inner: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl CustomObjectSlot {
    pub fn new() -> CustomObjectSlot {
        CustomObjectSlot { inner: Mutex::new(None) }
    }

    pub fn set<T: Any + Send + Sync>(&self, value: T) {
        *self.inner.lock().expect("custom object lock poisoned") = Some(Box::new(value));
    }

    /// Runs `f` with the attached object downcast to `T`, or `None` if nothing was attached or
    /// the attached value is a different type.
    pub fn with<T: Any, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.inner.lock().expect("custom object lock poisoned");
        f(guard.as_deref().and_then(|b| b.downcast_ref::<T>()))
    }
}

static NEXT_PING_ID: AtomicI32 = AtomicI32::new(1);

struct PendingPing {
    id: i32,
    start_ms: u64,
}

/// Liveness check bookkeeping. `id` is unique per process for the tracker's lifetime (drawn
/// from a process-wide monotonic counter, not scoped to one tracker), so a stale reply from a
/// previous check can never be confused with the current one.
pub struct PingTracker {
    timeout_ms: u64,
    last_delay_ms: Option<u64>,
    active: Option<PendingPing>,
}

impl PingTracker {
    pub fn new(timeout_ms: u64) -> PingTracker {
        PingTracker {
            timeout_ms,
            last_delay_ms: None,
            active: None,
        }
    }

    pub fn last_delay_ms(&self) -> Option<u64> {
        self.last_delay_ms
    }

    /// Arms the pending state and returns the id to send as `CHECK(id)`.
    pub fn initiate_ping(&mut self, now_ms: u64) -> i32 {
        let id = NEXT_PING_ID.fetch_add(1, Ordering::Relaxed);
        self.active = Some(PendingPing { id, start_ms: now_ms });
        id
    }

    /// Matches `id` against the currently armed ping. Disarms and records the delay on match;
    /// a mismatched id is a no-op (the caller is expected to log it).
    pub fn confirm(&mut self, id: i32, now_ms: u64) -> bool {
        match &self.active {
            Some(pending) if pending.id == id => {
                self.last_delay_ms = Some(now_ms.saturating_sub(pending.start_ms));
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// Disarms without recording a delay. Used when a check is abandoned (e.g. the connection
    /// is closing for an unrelated reason).
    pub fn cancel(&mut self, id: i32) -> bool {
        match &self.active {
            Some(pending) if pending.id == id => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        match &self.active {
            Some(pending) => now_ms.saturating_sub(pending.start_ms) > self.timeout_ms,
            None => false,
        }
    }
}

/// One peer connection, uniform over internal/stream/datagram transports. `state` and `ping`
/// share nothing but are locked independently; neither is ever held across the transport's
/// blocking send, other than the brief re-check documented on `send_packet`.
pub struct Connection {
    remote_id: NetworkId,
    state: Mutex<ConnectionState>,
    ping: Mutex<PingTracker>,
    host: Weak<dyn ConnectionHost>,
    transport: Mutex<Box<dyn Transport>>,
    custom_object: Arc<CustomObjectSlot>,
    encoder_pool: Arc<CoderPool>,
    log: Logger,
}

impl Connection {
    pub fn new(
        remote_id: NetworkId,
        host: Weak<dyn ConnectionHost>,
        transport: Box<dyn Transport>,
        ping_timeout_ms: u64,
        log: Logger,
        encoder_pool: Arc<CoderPool>,
    ) -> Connection {
        Connection {
            remote_id,
            state: Mutex::new(ConnectionState::Initialized),
            ping: Mutex::new(PingTracker::new(ping_timeout_ms)),
            host,
            transport: Mutex::new(transport),
            custom_object: Arc::new(CustomObjectSlot::new()),
            encoder_pool,
            log,
        }
    }

    pub fn remote_id(&self) -> &NetworkId {
        &self.remote_id
    }

    /// The slot a `ConfigureConnection` handler may have attached to before this connection was
    /// inserted into the registry (§4.E step 5). Shared with the dispatch path so packet
    /// handlers can read whatever was attached.
    pub fn custom_object(&self) -> &Arc<CustomObjectSlot> {
        &self.custom_object
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    /// Marks the connection open, bypassing the `Opening` handshake. Used by transports whose
    /// ack policy resolves synchronously (the internal peer transport).
    pub fn mark_open(&self) {
        *self.state.lock().expect("connection state lock poisoned") = ConnectionState::Open;
        debug!(self.log, "connection open"; "remote" => %self.remote_id);
    }

    /// Writes an already-encoded record straight to the transport, bypassing the
    /// open/checking state check. Used by the acceptor to send `CONNECTED` immediately after
    /// registry insertion, before the connection has been marked open.
    pub(crate) fn send_raw(&self, bytes: &[u8]) -> netsupport::NetworkResult<()> {
        self.transport.lock().expect("transport lock poisoned").send_record(bytes)
    }

    /// Begins opening. Only valid from `Initialized`. The caller is responsible for then
    /// driving the transport-specific handshake (synchronous for internal peers, `LOGIN` then
    /// await `CONNECTED` for stream/datagram).
    pub fn open(&self) -> bool {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        if *state != ConnectionState::Initialized {
            return false;
        }
        *state = ConnectionState::Opening;
        debug!(self.log, "connection opening"; "remote" => %self.remote_id);
        true
    }

    /// Observes the `CONNECTED` record: completes the `Opening → Open` transition.
    pub fn on_connected(&self) {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        if *state == ConnectionState::Opening {
            *state = ConnectionState::Open;
            debug!(self.log, "connection open"; "remote" => %self.remote_id);
        }
    }

    /// Closes the connection. Idempotent: closing an already-`Closing`/`Closed` connection is
    /// a no-op. Fires `ConnectionClosed` and removes itself from the manager's registry exactly
    /// once.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            if *state == ConnectionState::Closing || *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        self.transport.lock().expect("transport lock poisoned").close();

        if let Some(host) = self.host.upgrade() {
            host.remove_silently(&self.remote_id);
            host.post_event(Event::ConnectionClosed {
                id: self.remote_id.clone(),
                reason,
            });
        }

        *self.state.lock().expect("connection state lock poisoned") = ConnectionState::Closed;
        debug!(self.log, "connection closed"; "remote" => %self.remote_id, "reason" => ?reason);

        true
    }

    /// Initiates a liveness check. Only valid from `Open`.
    pub fn check(&self) -> bool {
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            if *state != ConnectionState::Open {
                return false;
            }
            *state = ConnectionState::Checking;
        }

        let id = self.ping.lock().expect("ping tracker lock poisoned").initiate_ping(clock_ms());

        match ControlRecord::Check(id).encode() {
            Ok(bytes) => {
                if self.transport.lock().expect("transport lock poisoned").send_record(&bytes).is_err() {
                    self.close(CloseReason::IoException);
                    return false;
                }
                true
            }
            Err(_) => {
                self.close(CloseReason::IoException);
                false
            }
        }
    }

    /// Encodes and sends a packet. Valid from `Open` or `Checking`. If the calling thread is not
    /// a valid encoder-pool thread (and a pool is configured), the encode-and-send runs on the
    /// pool instead, with this call blocking until it completes — `send_packet` always reports
    /// whether the payload actually reached the transport, per the send-then-close ordering
    /// guarantee, whichever thread did the work.
    pub fn send_packet(self: &Arc<Connection>, packet: Box<dyn Packet>, encode_buffer_initial_size: usize) -> bool {
        {
            let state = *self.state.lock().expect("connection state lock poisoned");
            if state != ConnectionState::Open && state != ConnectionState::Checking {
                return false;
            }
        }

        if self.encoder_pool.is_valid_coder_thread() {
            return self.encode_and_send(packet.as_ref(), encode_buffer_initial_size);
        }

        let packet_type = packet.packet_id();
        let remote_id = self.remote_id.clone();
        let host = self.host.clone();
        let (result_tx, result_rx) = std::sync::mpsc::sync_channel::<bool>(1);
        let this = self.clone();

        let accepted = self.encoder_pool.submit(
            move || {
                let sent = this.encode_and_send(packet.as_ref(), encode_buffer_initial_size);
                let _ = result_tx.send(sent);
            },
            move || {
                if let Some(host) = host.upgrade() {
                    host.post_event(Event::PacketSendingFailed {
                        id: remote_id,
                        packet_type,
                    });
                }
            },
        );

        if !accepted {
            return false;
        }

        result_rx.recv().unwrap_or(false)
    }

    /// The actual encode-and-transport-write, run either on the caller's own thread or (via
    /// `send_packet`'s offload) on an encoder-pool thread. Also called directly by broadcast,
    /// which always runs inline since it targets many connections per call and has no single
    /// packet ownership to hand to a pool.
    pub(crate) fn encode_and_send(&self, packet: &dyn Packet, encode_buffer_initial_size: usize) -> bool {
        let bytes = match encode_packet(packet, encode_buffer_initial_size) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        let state = *self.state.lock().expect("connection state lock poisoned");
        if state != ConnectionState::Open && state != ConnectionState::Checking {
            return false;
        }

        let sent = self.transport.lock().expect("transport lock poisoned").send_record(&bytes).is_ok();

        if !sent {
            if let Some(host) = self.host.upgrade() {
                host.post_event(Event::PacketSendingFailed {
                    id: self.remote_id.clone(),
                    packet_type: packet.packet_id(),
                });
            }
            self.close(CloseReason::IoException);
        }

        sent
    }

    /// Hands a decoded packet to the manager's dispatch path. Also exposed publicly so tests
    /// can inject packets without a real transport.
    pub fn receive_packet(&self, packet: Box<dyn Packet>) {
        if let Some(host) = self.host.upgrade() {
            host.dispatch_packet(&self.remote_id, packet, &self.custom_object);
        }
    }

    /// Handles a non-`PACKET` record decoded off the wire.
    pub fn on_control(&self, record: ControlRecord) {
        match record {
            ControlRecord::Check(id) => {
                if let Ok(bytes) = ControlRecord::CheckReply(id).encode() {
                    let _ = self.transport.lock().expect("transport lock poisoned").send_record(&bytes);
                }
            }
            ControlRecord::CheckReply(id) => {
                let now = clock_ms();
                let matched = self.ping.lock().expect("ping tracker lock poisoned").confirm(id, now);

                if matched {
                    let mut state = self.state.lock().expect("connection state lock poisoned");
                    if *state == ConnectionState::Checking {
                        *state = ConnectionState::Open;
                    }
                } else {
                    warn!(self.log, "discarding stale check reply"; "remote" => %self.remote_id, "uuid" => id);
                }
            }
            ControlRecord::Login => {
                // Already admitted during accept; a post-handshake LOGIN is a no-op.
            }
            ControlRecord::Connected => self.on_connected(),
            ControlRecord::Logout => {
                self.close(CloseReason::Remote);
            }
            ControlRecord::ServerInfoRequest => {
                // Out of core scope: the server-info broadcast utility handles this itself.
            }
        }
    }

    /// Called by the global timer or the manager's own housekeeping. Closes with `Timeout` if
    /// a `Checking` connection's outstanding ping has exceeded its timeout.
    pub fn update_status(&self) {
        let timed_out = {
            let state = *self.state.lock().expect("connection state lock poisoned");
            state == ConnectionState::Checking
                && self.ping.lock().expect("ping tracker lock poisoned").is_timed_out(clock_ms())
        };

        if timed_out {
            self.close(CloseReason::Timeout);
        }
    }

    pub fn last_ping_delay_ms(&self) -> Option<u64> {
        self.ping.lock().expect("ping tracker lock poisoned").last_delay_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransport;
    use std::sync::Arc;

    struct NoopHost;
    impl ConnectionHost for NoopHost {
        fn dispatch_packet(&self, _source: &NetworkId, _packet: Box<dyn Packet>, _custom_object: &Arc<CustomObjectSlot>) {}
        fn post_event(&self, _event: Event) {}
        fn remove_silently(&self, _id: &NetworkId) {}
        fn log(&self) -> &Logger {
            unimplemented!()
        }
    }

    fn test_connection() -> Arc<Connection> {
        let host: Arc<dyn ConnectionHost> = Arc::new(NoopHost);
        Arc::new(Connection::new(
            NetworkId::bind("peer", 1),
            Arc::downgrade(&host),
            Box::new(NullTransport::default()),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ))
    }

    #[test]
    fn open_only_from_initialized() {
        let conn = test_connection();
        assert!(conn.open());
        assert_eq!(conn.state(), ConnectionState::Opening);
        assert!(!conn.open());
    }

    #[test]
    fn close_is_idempotent() {
        let conn = test_connection();
        assert!(conn.open());
        conn.mark_open();
        assert!(conn.close(CloseReason::Expected));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.close(CloseReason::Expected));
    }

    #[test]
    fn check_requires_open() {
        let conn = test_connection();
        assert!(!conn.check());
        conn.open();
        conn.mark_open();
        assert!(conn.check());
        assert_eq!(conn.state(), ConnectionState::Checking);
    }

    #[test]
    fn ping_tracker_matches_only_armed_id() {
        let mut tracker = PingTracker::new(1_000);
        let id = tracker.initiate_ping(0);
        assert!(!tracker.confirm(id + 1, 10));
        assert!(tracker.confirm(id, 10));
        assert_eq!(tracker.last_delay_ms(), Some(10));
    }

    #[test]
    fn ping_tracker_times_out() {
        let mut tracker = PingTracker::new(50);
        let _id = tracker.initiate_ping(0);
        assert!(!tracker.is_timed_out(40));
        assert!(tracker.is_timed_out(51));
    }

    #[test]
    fn send_requires_open_or_checking() {
        let conn = test_connection();

        struct Dummy;
        impl Packet for Dummy {
            fn packet_id(&self) -> i32 {
                1
            }
            fn write_data(&self, _w: &mut dyn std::io::Write) -> std::io::Result<()> {
                Ok(())
            }
            fn read_data(&mut self, _r: &mut dyn std::io::Read) -> std::io::Result<()> {
                Ok(())
            }
        }

        assert!(!conn.send_packet(Box::new(Dummy), 64));
        conn.open();
        conn.mark_open();
        assert!(conn.send_packet(Box::new(Dummy), 64));
    }
}
