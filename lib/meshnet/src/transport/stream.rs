//! Blocking TCP transport. One reader thread per connection feeds bytes into a
//! `ByteAccumulator`; the write half is a plain `TcpStream::write_all` serialized by the
//! connection's transport lock.

use crate::coder_pool::CoderPool;
use crate::connection::{CloseReason, Connection};
use crate::events::{Event, EventHandler};
use crate::packet::PacketIdMappingProvider;
use crate::transport::Transport;
use crate::wire::frame::decode_packet_body;
use crate::wire::{ByteAccumulator, Frame};
use netsupport::logging::{warn, Logger};
use netsupport::{ErrorKind, NetworkError, NetworkResult};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

pub struct StreamTransport {
    stream: TcpStream,
}

impl StreamTransport {
    pub fn new(stream: TcpStream) -> StreamTransport {
        StreamTransport { stream }
    }

    pub fn try_clone(&self) -> std::io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

impl Transport for StreamTransport {
    fn send_record(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Runs the blocking read loop for a stream connection until the socket errors or is shut
/// down, translating the outcome into the matching `CloseReason`. Spawned once per connection
/// by the acceptor (server side) or by `open()` (client side).
pub fn spawn_reader(
    mut stream: TcpStream,
    connection: Arc<Connection>,
    mapping: Arc<PacketIdMappingProvider>,
    decoder_pool: Arc<CoderPool>,
    events: Arc<EventHandler>,
    log: Logger,
) {
    thread::spawn(move || {
        let mut accumulator = ByteAccumulator::new(log.clone());
        let mut buf = [0u8; 4096];

        loop {
            let read = match stream.read(&mut buf) {
                Ok(0) => {
                    connection.close(CloseReason::Remote);
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    let reason = match err.kind() {
                        std::io::ErrorKind::Interrupted => CloseReason::Interrupted,
                        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset => CloseReason::External,
                        _ => CloseReason::IoException,
                    };
                    connection.close(reason);
                    return;
                }
            };

            match accumulator.feed(&buf[..read], &mapping) {
                Ok(frames) => {
                    for frame in frames {
                        match frame {
                            Frame::RawPacket { packet_id, body } => {
                                deliver_raw_packet(packet_id, body, &connection, &mapping, &decoder_pool, &events);
                            }
                            Frame::Control(record) => connection.on_control(record),
                        }
                    }
                }
                Err(NetworkError::Fatal(ErrorKind::NegativeLength)) => {
                    warn!(log, "closing connection after unrecoverable framing error"; "remote" => %connection.remote_id());
                    connection.close(CloseReason::Protocol);
                    return;
                }
                Err(_) => {
                    connection.close(CloseReason::IoException);
                    return;
                }
            }
        }
    });
}

/// Decodes a framed-but-undecoded packet body and hands it to the connection, either inline or
/// via the decoder pool depending on `is_valid_coder_thread()`. Shared by every reader (stream,
/// internal) that receives `Frame::RawPacket`.
pub(crate) fn deliver_raw_packet(
    packet_id: i32,
    body: Vec<u8>,
    connection: &Arc<Connection>,
    mapping: &Arc<PacketIdMappingProvider>,
    decoder_pool: &Arc<CoderPool>,
    events: &Arc<EventHandler>,
) {
    if decoder_pool.is_valid_coder_thread() {
        if let Ok(packet) = decode_packet_body(packet_id, &body, mapping) {
            connection.receive_packet(packet);
        }
        return;
    }

    let connection = connection.clone();
    let mapping = mapping.clone();
    let remote_id = connection.remote_id().clone();
    let events = events.clone();

    decoder_pool.submit(
        move || {
            if let Ok(packet) = decode_packet_body(packet_id, &body, &mapping) {
                connection.receive_packet(packet);
            }
        },
        move || {
            events.dispatch(&Event::PacketReceiveRejected {
                source_id: remote_id,
                packet_type: packet_id,
            });
        },
    );
}
