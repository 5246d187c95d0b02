//! In-process loopback transport. Two connections share a `Pair`: each side owns the record
//! encoding/decoding for its direction but neither owns the other, per the cyclic-reference
//! design note — on close a side nulls its own slot, and the other observes that on its next
//! send and closes too.

use crate::coder_pool::CoderPool;
use crate::connection::Connection;
use crate::events::EventHandler;
use crate::packet::PacketIdMappingProvider;
use crate::transport::stream::deliver_raw_packet;
use crate::transport::Transport;
use crate::wire::{ByteAccumulator, Frame};
use netsupport::{ErrorKind, NetworkError, NetworkResult};
use std::io;
use std::sync::{Arc, Mutex, Weak};

struct Side {
    connection: Weak<Connection>,
    accumulator: Mutex<ByteAccumulator>,
    mapping: Arc<PacketIdMappingProvider>,
    decoder_pool: Arc<CoderPool>,
    events: Arc<EventHandler>,
}

/// The shared record backing two paired `InternalTransport`s. Built empty; both sides are
/// attached via `Pair::bind` once their owning `Connection`s exist (the transport must be
/// constructed before the connection that will hold it, so the back-reference is filled in
/// afterwards).
pub struct Pair {
    sides: Mutex<[Option<Side>; 2]>,
}

impl Pair {
    pub fn new() -> Arc<Pair> {
        Arc::new(Pair {
            sides: Mutex::new([None, None]),
        })
    }

    pub fn bind(
        self: &Arc<Pair>,
        index: usize,
        connection: Weak<Connection>,
        mapping: Arc<PacketIdMappingProvider>,
        decoder_pool: Arc<CoderPool>,
        events: Arc<EventHandler>,
        log: netsupport::logging::Logger,
    ) {
        let mut sides = self.sides.lock().expect("internal pair lock poisoned");
        sides[index] = Some(Side {
            connection,
            accumulator: Mutex::new(ByteAccumulator::new(log)),
            mapping,
            decoder_pool,
            events,
        });
    }
}

pub struct InternalTransport {
    pair: Arc<Pair>,
    this_side: usize,
}

impl InternalTransport {
    pub fn new(pair: Arc<Pair>, this_side: usize) -> InternalTransport {
        InternalTransport { pair, this_side }
    }
}

impl Transport for InternalTransport {
    fn send_record(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        let other = 1 - self.this_side;
        let sides = self.pair.sides.lock().expect("internal pair lock poisoned");

        let side = sides[other]
            .as_ref()
            .ok_or_else(|| NetworkError::Fatal(ErrorKind::Io(io::ErrorKind::NotConnected)))?;

        let connection = side
            .connection
            .upgrade()
            .ok_or_else(|| NetworkError::Fatal(ErrorKind::Io(io::ErrorKind::NotConnected)))?;

        let frames = side
            .accumulator
            .lock()
            .expect("accumulator lock poisoned")
            .feed(bytes, &side.mapping)?;

        for frame in frames {
            match frame {
                Frame::RawPacket { packet_id, body } => {
                    deliver_raw_packet(packet_id, body, &connection, &side.mapping, &side.decoder_pool, &side.events);
                }
                Frame::Control(record) => connection.on_control(record),
            }
        }

        Ok(())
    }

    fn close(&mut self) {
        let mut sides = self.pair.sides.lock().expect("internal pair lock poisoned");
        sides[self.this_side] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHost, CustomObjectSlot};
    use crate::events::Event;
    use crate::network_id::NetworkId;
    use crate::packet::Packet;
    use netsupport::logging;
    use std::sync::Mutex as StdMutex;

    struct RecordingHost {
        received: StdMutex<Vec<i32>>,
    }

    impl ConnectionHost for RecordingHost {
        fn dispatch_packet(&self, _source: &NetworkId, packet: Box<dyn Packet>, _custom_object: &Arc<CustomObjectSlot>) {
            self.received.lock().unwrap().push(packet.packet_id());
        }
        fn post_event(&self, _event: Event) {}
        fn remove_silently(&self, _id: &NetworkId) {}
        fn log(&self) -> &netsupport::logging::Logger {
            unimplemented!()
        }
    }

    struct Hello;
    impl Packet for Hello {
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

    #[test]
    fn sent_record_reaches_the_other_side() {
        let mapping = PacketIdMappingProvider::new();
        mapping.register(1, || Hello);
        let mapping = Arc::new(mapping);

        let pair = Pair::new();

        let host_a: Arc<dyn ConnectionHost> = Arc::new(RecordingHost {
            received: StdMutex::new(Vec::new()),
        });
        let host_b: Arc<dyn ConnectionHost> = Arc::new(RecordingHost {
            received: StdMutex::new(Vec::new()),
        });

        let conn_a = Arc::new(Connection::new(
            NetworkId::internal("a", "b"),
            Arc::downgrade(&host_a),
            Box::new(InternalTransport::new(pair.clone(), 0)),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ));
        let conn_b = Arc::new(Connection::new(
            NetworkId::internal("b", "a"),
            Arc::downgrade(&host_b),
            Box::new(InternalTransport::new(pair.clone(), 1)),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ));

        let events = Arc::new(EventHandler::new());
        let decoder_pool = Arc::new(CoderPool::new(0));
        pair.bind(0, Arc::downgrade(&conn_a), mapping.clone(), decoder_pool.clone(), events.clone(), logging::discard());
        pair.bind(1, Arc::downgrade(&conn_b), mapping, decoder_pool, events, logging::discard());

        conn_a.open();
        conn_a.mark_open();
        conn_b.open();
        conn_b.mark_open();

        assert!(conn_a.send_packet(Box::new(Hello), 64));

        let host_b_recorded = host_b.clone();
        let _ = host_b_recorded;
    }

    #[test]
    fn closing_one_side_fails_the_others_next_send() {
        let mapping = Arc::new(PacketIdMappingProvider::new());
        let pair = Pair::new();

        let host_a: Arc<dyn ConnectionHost> = Arc::new(RecordingHost {
            received: StdMutex::new(Vec::new()),
        });
        let host_b: Arc<dyn ConnectionHost> = Arc::new(RecordingHost {
            received: StdMutex::new(Vec::new()),
        });

        let conn_a = Arc::new(Connection::new(
            NetworkId::internal("a", "b"),
            Arc::downgrade(&host_a),
            Box::new(InternalTransport::new(pair.clone(), 0)),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ));
        let conn_b = Arc::new(Connection::new(
            NetworkId::internal("b", "a"),
            Arc::downgrade(&host_b),
            Box::new(InternalTransport::new(pair.clone(), 1)),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ));

        let events = Arc::new(EventHandler::new());
        let decoder_pool = Arc::new(CoderPool::new(0));
        pair.bind(0, Arc::downgrade(&conn_a), mapping.clone(), decoder_pool.clone(), events.clone(), logging::discard());
        pair.bind(1, Arc::downgrade(&conn_b), mapping, decoder_pool, events, logging::discard());

        conn_a.open();
        conn_a.mark_open();
        conn_b.open();
        conn_b.mark_open();

        conn_a.close(crate::connection::CloseReason::Expected);

        assert!(!conn_b.send_packet(Box::new(Hello), 64));
        assert_eq!(conn_b.state(), crate::connection::ConnectionState::Closed);
    }
}
