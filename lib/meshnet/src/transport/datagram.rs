//! Blocking UDP transport. Symmetric with the stream transport at the record level: every
//! datagram carries exactly one record, so there is no `ByteAccumulator` involved — a datagram
//! either decodes as a single record or is dropped.
//!
//! The server side additionally tracks an *anonymous adapter* per source address until a
//! `LOGIN` record arrives, at which point the acceptor materializes a real `Connection`.

use crate::coder_pool::CoderPool;
use crate::connection::{CloseReason, Connection};
use crate::events::EventHandler;
use crate::packet::PacketIdMappingProvider;
use crate::transport::Transport;
use crate::wire::frame::{ControlRecord, MAGIC_CHECK, MAGIC_CHECK_REPLY, MAGIC_CONNECTED, MAGIC_LOGIN, MAGIC_LOGOUT, MAGIC_PACKET, MAGIC_SERVERINFORQ};
use byteorder::{BigEndian, ReadBytesExt};
use netsupport::logging::{warn, Logger};
use netsupport::{ErrorKind, NetworkError, NetworkResult};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;

pub struct DatagramTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl DatagramTransport {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> DatagramTransport {
        DatagramTransport { socket, peer }
    }
}

impl Transport for DatagramTransport {
    fn send_record(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        self.socket.send_to(bytes, self.peer)?;
        Ok(())
    }

    fn close(&mut self) {
        // The UDP socket is shared with the receiver loop (server) or owned outright (client);
        // either way there is no per-connection handle to tear down here.
    }
}

/// Frames exactly one record from a single datagram's bytes. Unlike the stream accumulator,
/// there is no partial state or resync: a malformed datagram is simply dropped. Mirrors the
/// accumulator's split: only the id-mapped check runs here, leaving the actual `read_data` body
/// decode to `frame::decode_packet_body`, callable inline or via a decoder pool.
pub fn decode_single(bytes: &[u8], mapping: &PacketIdMappingProvider) -> NetworkResult<SingleRecord> {
    let mut cursor = bytes;
    let magic = cursor.read_i32::<BigEndian>()?;

    match magic {
        MAGIC_LOGIN => Ok(SingleRecord::Control(ControlRecord::Login)),
        MAGIC_LOGOUT => Ok(SingleRecord::Control(ControlRecord::Logout)),
        MAGIC_CONNECTED => Ok(SingleRecord::Control(ControlRecord::Connected)),
        MAGIC_SERVERINFORQ => Ok(SingleRecord::Control(ControlRecord::ServerInfoRequest)),
        MAGIC_CHECK => Ok(SingleRecord::Control(ControlRecord::Check(cursor.read_i32::<BigEndian>()?))),
        MAGIC_CHECK_REPLY => Ok(SingleRecord::Control(ControlRecord::CheckReply(cursor.read_i32::<BigEndian>()?))),
        MAGIC_PACKET => {
            let packet_id = cursor.read_i32::<BigEndian>()?;
            let length = cursor.read_i32::<BigEndian>()?;
            if length < 0 {
                return Err(NetworkError::Fatal(ErrorKind::NegativeLength));
            }
            if !mapping.contains(packet_id) {
                return Err(NetworkError::Fatal(ErrorKind::UnmappedPacketId(packet_id)));
            }
            Ok(SingleRecord::RawPacket {
                packet_id,
                body: cursor.to_vec(),
            })
        }
        other => Err(NetworkError::Fatal(ErrorKind::UnknownMagic(other))),
    }
}

pub enum SingleRecord {
    RawPacket { packet_id: i32, body: Vec<u8> },
    Control(ControlRecord),
}

/// An established datagram connection the server receiver loop routes bytes to, keyed by
/// source address. Lighter than a full `StreamTransport` read loop since there is no per-peer
/// thread — the single shared receiver loop demuxes by address.
pub struct ConnectionTable {
    by_addr: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            by_addr: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, addr: SocketAddr, connection: Arc<Connection>) {
        self.by_addr.lock().expect("datagram connection table lock poisoned").insert(addr, connection);
    }

    pub fn remove(&self, addr: &SocketAddr) {
        self.by_addr.lock().expect("datagram connection table lock poisoned").remove(addr);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.by_addr.lock().expect("datagram connection table lock poisoned").get(addr).cloned()
    }
}

/// The shared receiver loop for a datagram client. One datagram in, one record framed; a
/// `RawPacket` is decoded inline or via `decoder_pool` depending on `is_valid_coder_thread()`,
/// the rest routed straight to `connection`.
pub fn spawn_client_reader(
    socket: UdpSocket,
    connection: Arc<Connection>,
    mapping: Arc<PacketIdMappingProvider>,
    decoder_pool: Arc<CoderPool>,
    events: Arc<EventHandler>,
    log: Logger,
) {
    thread::spawn(move || {
        let mut buf = [0u8; 65_536];
        loop {
            let read = match socket.recv(&mut buf) {
                Ok(n) => n,
                Err(_) => {
                    connection.close(CloseReason::IoException);
                    return;
                }
            };

            match decode_single(&buf[..read], &mapping) {
                Ok(SingleRecord::RawPacket { packet_id, body }) => {
                    crate::transport::stream::deliver_raw_packet(packet_id, body, &connection, &mapping, &decoder_pool, &events);
                }
                Ok(SingleRecord::Control(record)) => connection.on_control(record),
                Err(err) => warn!(log, "dropping malformed datagram"; "remote" => %connection.remote_id(), "error" => %err),
            }
        }
    });
}
