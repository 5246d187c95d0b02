//! Turns a raw inbound connection (an accepted TCP socket, or a `LOGIN` datagram from a new
//! source address) into a registered `Connection`, running the filter/configure event pair
//! described in §4.E before anything is added to the registry.

use crate::coder_pool::CoderPool;
use crate::config::ManagerConfig;
use crate::connection::{CloseReason, Connection, ConnectionHost, CustomObjectSlot};
use crate::events::{Event, EventHandler};
use crate::network_id::NetworkId;
use crate::packet::PacketIdMappingProvider;
use crate::server_registry::{ServerRegistry, ServerState};
use crate::transport::datagram::{decode_single, ConnectionTable, DatagramTransport, SingleRecord};
use crate::transport::stream::{deliver_raw_packet, spawn_reader, StreamTransport};
use crate::transport::Transport;
use crate::wire::frame::ControlRecord;
use netsupport::logging::{debug, warn, Logger};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

static NEXT_REMOTE_ID: AtomicUsize = AtomicUsize::new(1);

fn suggested_name() -> String {
    format!("RemoteId-{}", NEXT_REMOTE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Runs the filter → build-id half of the admit sequence shared by the stream and datagram
/// acceptors. Returns `None` if the attempt was cancelled or the server was not `Running`.
/// `ConfigureConnection` is posted separately, by `configure`, once the connection (and its
/// attachable custom-object slot) exists.
fn admit(registry: &ServerRegistry, events: &EventHandler, addr: SocketAddr) -> Option<NetworkId> {
    if registry.state() != ServerState::Running {
        return None;
    }

    let outcome = events.dispatch_filter(&addr, &suggested_name());
    if outcome.cancel {
        return None;
    }

    Some(NetworkId::connect(outcome.name, addr))
}

/// Posts `ConfigureConnection` for a connection that has just been constructed but not yet
/// inserted into the registry (§4.E step 5), sharing its custom-object slot with any handler
/// that wants to attach to it.
fn configure(events: &EventHandler, new_id: &NetworkId, custom_object: &Arc<CustomObjectSlot>) {
    events.dispatch(&Event::ConfigureConnection {
        new_id: new_id.clone(),
        custom_object: custom_object.clone(),
    });
}

/// Accepts stream connections on `listener` until it errors (normally: the listener was
/// dropped as part of server shutdown).
pub fn spawn_stream_acceptor(
    listener: TcpListener,
    registry: Arc<ServerRegistry>,
    events: Arc<EventHandler>,
    host: Weak<dyn ConnectionHost>,
    mapping: Arc<PacketIdMappingProvider>,
    encoder_pool: Arc<CoderPool>,
    decoder_pool: Arc<CoderPool>,
    config: ManagerConfig,
    log: Logger,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let new_id = match admit(&registry, &events, addr) {
            Some(id) => id,
            None => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                continue;
            }
        };

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => continue,
        };

        let connection = Arc::new(Connection::new(
            new_id.clone(),
            host.clone(),
            Box::new(StreamTransport::new(stream)),
            config.connection_check_timeout_ms,
            log.clone(),
            encoder_pool.clone(),
        ));
        configure(&events, &new_id, connection.custom_object());

        if !registry.add_initialized(connection.clone()) {
            connection.close(CloseReason::Server);
            continue;
        }

        debug!(log, "accepted stream connection"; "remote" => %new_id);

        if let Ok(bytes) = ControlRecord::Connected.encode() {
            let _ = connection.send_raw(&bytes);
        }
        connection.mark_open();

        spawn_reader(reader_stream, connection, mapping.clone(), decoder_pool.clone(), events.clone(), log.clone());
    })
}

/// Runs the single shared receive loop for a datagram server: demultiplexes by source address,
/// tracking an anonymous adapter (just the address) until `LOGIN` arrives, at which point a
/// real `Connection` is materialized via the same filter/configure sequence as the stream
/// acceptor.
pub fn spawn_datagram_acceptor(
    socket: UdpSocket,
    registry: Arc<ServerRegistry>,
    events: Arc<EventHandler>,
    host: Weak<dyn ConnectionHost>,
    mapping: Arc<PacketIdMappingProvider>,
    encoder_pool: Arc<CoderPool>,
    decoder_pool: Arc<CoderPool>,
    config: ManagerConfig,
    log: Logger,
) -> thread::JoinHandle<()> {
    let table = Arc::new(ConnectionTable::new());

    thread::spawn(move || {
        let mut buf = [0u8; 65_536];

        loop {
            let (read, addr) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(_) => return,
            };

            if let Some(connection) = table.get(&addr) {
                match decode_single(&buf[..read], &mapping) {
                    Ok(SingleRecord::RawPacket { packet_id, body }) => {
                        deliver_raw_packet(packet_id, body, &connection, &mapping, &decoder_pool, &events);
                    }
                    Ok(SingleRecord::Control(ControlRecord::Logout)) => {
                        connection.close(CloseReason::Remote);
                        table.remove(&addr);
                    }
                    Ok(SingleRecord::Control(record)) => connection.on_control(record),
                    Err(err) => warn!(log, "dropping malformed datagram"; "remote" => %addr, "error" => %err),
                }
                continue;
            }

            match decode_single(&buf[..read], &mapping) {
                Ok(SingleRecord::Control(ControlRecord::Login)) => {
                    let new_id = match admit(&registry, &events, addr) {
                        Some(id) => id,
                        None => continue,
                    };

                    let transport = DatagramTransport::new(
                        socket.try_clone().expect("datagram server socket must be cloneable"),
                        addr,
                    );

                    let connection = Arc::new(Connection::new(
                        new_id.clone(),
                        host.clone(),
                        Box::new(transport),
                        config.connection_check_timeout_ms,
                        log.clone(),
                        encoder_pool.clone(),
                    ));
                    configure(&events, &new_id, connection.custom_object());

                    if !registry.add_initialized(connection.clone()) {
                        continue;
                    }

                    debug!(log, "materialized datagram connection"; "remote" => %new_id);
                    table.insert(addr, connection.clone());

                    if let Ok(bytes) = ControlRecord::Connected.encode() {
                        let _ = connection.send_raw(&bytes);
                    }
                    connection.mark_open();
                }
                _ => {
                    // Anything other than LOGIN from an unknown address is not a connection
                    // attempt; drop it silently.
                }
            }
        }
    })
}
