//! The public client/server surface: construction, open/close/check/send on the client side,
//! start/stop/send_to/broadcast/disconnect on the server side, and handler registration shared
//! by both through `ManagerCore`.

use crate::acceptor::{spawn_datagram_acceptor, spawn_stream_acceptor};
use crate::coder_pool::CoderPool;
use crate::config::{ConfigError, ManagerConfig, ServerType};
use crate::connection::{CloseReason, Connection, ConnectionHost, CustomObjectSlot};
use crate::dispatch::{Dispatch, PacketHandler};
use crate::events::{Event, EventHandler, FilterHandler};
use crate::internal_registry;
use crate::network_id::{Feature, NetworkId};
use crate::packet::{Packet, PacketIdMappingProvider};
use crate::server_registry::{ServerRegistry, ServerState};
use crate::timer::{GlobalTimer, Tickable};
use crate::transport::internal::{InternalTransport, Pair};
use crate::transport::stream::{spawn_reader, StreamTransport};
use crate::wire::frame::ControlRecord;
use netsupport::logging::{self, debug, Logger};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, Weak};

/// Shared state and callbacks for both manager kinds. A server manager additionally carries a
/// `ServerRegistry`; a client manager leaves it `None` and tracks its single connection itself.
pub struct ManagerCore {
    local_id: NetworkId,
    config: ManagerConfig,
    mapping: Arc<PacketIdMappingProvider>,
    dispatch: Dispatch,
    events: Arc<EventHandler>,
    encoder_pool: Arc<CoderPool>,
    decoder_pool: Arc<CoderPool>,
    registry: Option<Arc<ServerRegistry>>,
    log: Logger,
}

impl ManagerCore {
    fn new(local_id: NetworkId, config: ManagerConfig, registry: Option<Arc<ServerRegistry>>) -> Result<Arc<ManagerCore>, ConfigError> {
        config.validate()?;

        let log = logging::terminal().new(logging::o!("local_id" => local_id.to_string()));
        let dispatch = if config.use_handler_thread {
            Dispatch::managed_thread(config.packet_queue_capacity, log.clone())
        } else {
            Dispatch::caller_thread()
        };

        Ok(Arc::new(ManagerCore {
            local_id,
            mapping: Arc::new(PacketIdMappingProvider::new()),
            dispatch,
            events: Arc::new(EventHandler::new()),
            encoder_pool: Arc::new(CoderPool::new(if config.use_encoder_thread_pool { 2 } else { 0 })),
            decoder_pool: Arc::new(CoderPool::new(if config.use_decoder_thread_pool { 2 } else { 0 })),
            registry,
            config,
            log,
        }))
    }

    pub fn mapping_container(&self) -> &PacketIdMappingProvider {
        &self.mapping
    }

    pub fn add_packet_handler(&self, handler: PacketHandler) {
        self.dispatch.add_handler(handler);
    }

    pub fn add_event_handler(&self, priority: i32, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.events.add_handler(priority, handler);
    }

    pub fn add_filter_handler(&self, priority: i32, handler: FilterHandler) {
        self.events.add_filter_handler(priority, move |addr, name| handler(addr, name));
    }
}

impl ConnectionHost for ManagerCore {
    fn dispatch_packet(&self, source: &NetworkId, packet: Box<dyn Packet>, custom_object: &Arc<CustomObjectSlot>) {
        self.dispatch.deliver(source, packet, custom_object, &self.events);
    }

    fn post_event(&self, event: Event) {
        self.events.dispatch(&event);
    }

    fn remove_silently(&self, id: &NetworkId) {
        if let Some(registry) = &self.registry {
            registry.remove_silently(id);
        }
    }

    fn log(&self) -> &Logger {
        &self.log
    }
}

impl Tickable for ManagerCore {
    fn update_connection_status(&self) {
        if let Some(registry) = &self.registry {
            for connection in registry.fast_iter().values() {
                connection.update_status();
            }
        }
    }
}

/// Creates the transport-specific connection for `open()`, driving each transport's ack
/// policy. Shared between `ClientManager::open` and tests.
fn open_transport(core: &Arc<ManagerCore>, remote_id: &NetworkId) -> Option<Arc<Connection>> {
    match remote_id.feature() {
        Feature::Internal(_) => {
            let server = internal_registry::lookup(remote_id)?;
            let pair = Pair::new();

            let client_conn = Arc::new(Connection::new(
                remote_id.clone(),
                Arc::downgrade(core) as Weak<dyn ConnectionHost>,
                Box::new(InternalTransport::new(pair.clone(), 0)),
                core.config.connection_check_timeout_ms,
                core.log.clone(),
                core.encoder_pool.clone(),
            ));

            let peer_conn = server.create_internal_peer(core.local_id.clone(), pair.clone())?;

            pair.bind(
                0,
                Arc::downgrade(&client_conn),
                core.mapping.clone(),
                core.decoder_pool.clone(),
                core.events.clone(),
                core.log.clone(),
            );
            pair.bind(
                1,
                Arc::downgrade(&peer_conn),
                server.core.mapping.clone(),
                server.core.decoder_pool.clone(),
                server.core.events.clone(),
                server.core.log.clone(),
            );

            client_conn.open();
            client_conn.mark_open();
            peer_conn.open();
            peer_conn.mark_open();

            Some(client_conn)
        }
        Feature::Connect(addr) => match core.config.server_type {
            ServerType::Udp => open_datagram_client(core, remote_id, *addr),
            _ => open_stream_client(core, remote_id, *addr),
        },
        Feature::Bind(_) => None,
    }
}

fn open_stream_client(core: &Arc<ManagerCore>, remote_id: &NetworkId, addr: SocketAddr) -> Option<Arc<Connection>> {
    let stream = TcpStream::connect(addr).ok()?;
    let reader_stream = stream.try_clone().ok()?;

    let connection = Arc::new(Connection::new(
        remote_id.clone(),
        Arc::downgrade(core) as Weak<dyn ConnectionHost>,
        Box::new(StreamTransport::new(stream)),
        core.config.connection_check_timeout_ms,
        core.log.clone(),
        core.encoder_pool.clone(),
    ));

    connection.open();
    if let Ok(bytes) = ControlRecord::Login.encode() {
        let _ = connection.send_raw(&bytes);
    }

    spawn_reader(
        reader_stream,
        connection.clone(),
        core.mapping.clone(),
        core.decoder_pool.clone(),
        core.events.clone(),
        core.log.clone(),
    );

    Some(connection)
}

fn open_datagram_client(core: &Arc<ManagerCore>, remote_id: &NetworkId, addr: SocketAddr) -> Option<Arc<Connection>> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(addr).ok()?;
    let reader_socket = socket.try_clone().ok()?;

    let transport = crate::transport::datagram::DatagramTransport::new(socket, addr);

    let connection = Arc::new(Connection::new(
        remote_id.clone(),
        Arc::downgrade(core) as Weak<dyn ConnectionHost>,
        Box::new(transport),
        core.config.connection_check_timeout_ms,
        core.log.clone(),
        core.encoder_pool.clone(),
    ));

    connection.open();
    if let Ok(bytes) = ControlRecord::Login.encode() {
        let _ = connection.send_raw(&bytes);
    }

    crate::transport::datagram::spawn_client_reader(
        reader_socket,
        connection.clone(),
        core.mapping.clone(),
        core.decoder_pool.clone(),
        core.events.clone(),
        core.log.clone(),
    );

    Some(connection)
}

/// The client side of one peer relationship: exactly one connection at a time.
pub struct ClientManager {
    core: Arc<ManagerCore>,
    remote_id: NetworkId,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ClientManager {
    pub fn new(local_id: NetworkId, remote_id: NetworkId, config: ManagerConfig) -> Result<ClientManager, ConfigError> {
        Ok(ClientManager {
            core: ManagerCore::new(local_id, config, None)?,
            remote_id,
            connection: Mutex::new(None),
        })
    }

    pub fn mapping_container(&self) -> &PacketIdMappingProvider {
        self.core.mapping_container()
    }

    pub fn add_packet_handler(&self, handler: PacketHandler) {
        self.core.add_packet_handler(handler);
    }

    pub fn add_event_handler(&self, priority: i32, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.core.add_event_handler(priority, handler);
    }

    /// Resolves the transport for `remote_id` and drives that transport's ack policy (§4.B).
    pub fn open(&self) -> bool {
        let connection = match open_transport(&self.core, &self.remote_id) {
            Some(conn) => conn,
            None => return false,
        };

        if self.core.config.global_connection_check {
            GlobalTimer::instance().subscribe(Arc::downgrade(&self.core) as Weak<dyn Tickable>);
        }

        *self.connection.lock().expect("client manager connection lock poisoned") = Some(connection);
        true
    }

    pub fn close(&self) -> bool {
        match self.connection.lock().expect("client manager connection lock poisoned").take() {
            Some(connection) => connection.close(CloseReason::Expected),
            None => false,
        }
    }

    pub fn check(&self) -> bool {
        match &*self.connection.lock().expect("client manager connection lock poisoned") {
            Some(connection) => connection.check(),
            None => false,
        }
    }

    pub fn send(&self, packet: Box<dyn Packet>) -> bool {
        match &*self.connection.lock().expect("client manager connection lock poisoned") {
            Some(connection) => connection.send_packet(packet, self.core.config.encode_buffer_initial_size),
            None => false,
        }
    }

    pub fn is_valid_encoder_thread(&self) -> bool {
        self.core.encoder_pool.is_valid_coder_thread()
    }

    pub fn is_valid_decoder_thread(&self) -> bool {
        self.core.decoder_pool.is_valid_coder_thread()
    }
}

/// The server side of a peer relationship: owns a registry of inbound connections and the
/// accept loop(s) that populate it.
pub struct ServerManager {
    core: Arc<ManagerCore>,
    local_id: NetworkId,
    registry: Arc<ServerRegistry>,
    acceptors: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stream_local_addr: Mutex<Option<SocketAddr>>,
    datagram_local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerManager {
    pub fn new(local_id: NetworkId, config: ManagerConfig) -> Result<ServerManager, ConfigError> {
        let registry = Arc::new(ServerRegistry::new());
        let core = ManagerCore::new(local_id.clone(), config, Some(registry.clone()))?;

        Ok(ServerManager {
            core,
            local_id,
            registry,
            acceptors: Mutex::new(Vec::new()),
            stream_local_addr: Mutex::new(None),
            datagram_local_addr: Mutex::new(None),
        })
    }

    /// The address the stream (TCP) listener actually bound to, once `start()` has succeeded
    /// for a `Tcp`/`Combined` server. Needed when `NetworkId::bind` names an ephemeral port
    /// (`0`) and a caller must learn the real port to hand to a client.
    pub fn stream_local_addr(&self) -> Option<SocketAddr> {
        *self.stream_local_addr.lock().expect("server manager addr lock poisoned")
    }

    /// As `stream_local_addr`, for the `Udp`/`Combined` datagram socket.
    pub fn datagram_local_addr(&self) -> Option<SocketAddr> {
        *self.datagram_local_addr.lock().expect("server manager addr lock poisoned")
    }

    pub fn mapping_container(&self) -> &PacketIdMappingProvider {
        self.core.mapping_container()
    }

    pub fn add_packet_handler(&self, handler: PacketHandler) {
        self.core.add_packet_handler(handler);
    }

    pub fn add_event_handler(&self, priority: i32, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.core.add_event_handler(priority, handler);
    }

    pub fn add_filter_handler(&self, priority: i32, handler: FilterHandler) {
        self.core.events.add_filter_handler(priority, move |addr, name| handler(addr, name));
    }

    /// Starts accepting connections. `Internal`/`Combined` servers register in the process
    /// internal registry when `register_internal_server` is set; `Tcp`/`Combined` spawn a
    /// stream acceptor; `Udp`/`Combined` spawn the datagram receive loop.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.registry.state() != ServerState::Initialized {
            return false;
        }
        self.registry.set_state(ServerState::Starting);

        if self.core.config.register_internal_server || self.core.config.server_type == ServerType::Internal {
            if !internal_registry::register(self.local_id.clone(), Arc::clone(self)) {
                self.registry.set_state(ServerState::Initialized);
                return false;
            }
        }

        let mut acceptors = self.acceptors.lock().expect("server manager acceptors lock poisoned");

        if matches!(self.core.config.server_type, ServerType::Tcp | ServerType::Combined) {
            let port = match self.local_id.feature() {
                Feature::Bind(port) => *port,
                _ => 0,
            };
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(listener) => {
                    *self.stream_local_addr.lock().expect("server manager addr lock poisoned") = listener.local_addr().ok();
                    acceptors.push(spawn_stream_acceptor(
                        listener,
                        self.registry.clone(),
                        self.core.events.clone(),
                        Arc::downgrade(&self.core) as Weak<dyn ConnectionHost>,
                        self.core.mapping.clone(),
                        self.core.encoder_pool.clone(),
                        self.core.decoder_pool.clone(),
                        self.core.config.clone(),
                        self.core.log.clone(),
                    ))
                }
                Err(_) => {
                    self.registry.set_state(ServerState::Initialized);
                    return false;
                }
            }
        }

        if matches!(self.core.config.server_type, ServerType::Udp | ServerType::Combined) {
            let port = match self.local_id.feature() {
                Feature::Bind(port) => *port,
                _ => 0,
            };
            match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => {
                    *self.datagram_local_addr.lock().expect("server manager addr lock poisoned") = socket.local_addr().ok();
                    acceptors.push(spawn_datagram_acceptor(
                        socket,
                        self.registry.clone(),
                        self.core.events.clone(),
                        Arc::downgrade(&self.core) as Weak<dyn ConnectionHost>,
                        self.core.mapping.clone(),
                        self.core.encoder_pool.clone(),
                        self.core.decoder_pool.clone(),
                        self.core.config.clone(),
                        self.core.log.clone(),
                    ))
                }
                Err(_) => {
                    self.registry.set_state(ServerState::Initialized);
                    return false;
                }
            }
        }

        drop(acceptors);

        self.registry.set_state(ServerState::Running);

        if self.core.config.global_connection_check {
            GlobalTimer::instance().subscribe(Arc::downgrade(&self.core) as Weak<dyn Tickable>);
        }

        debug!(self.core.log, "server started"; "local_id" => %self.local_id);
        true
    }

    /// `Running → Stopping`: closes every connection with reason `Server`, clears the map,
    /// then `→ Stopped`. Accept threads are left to exit on their own once their listening
    /// socket is dropped (`acceptors` is dropped with the manager).
    pub fn stop(&self) -> bool {
        if self.registry.state() != ServerState::Running {
            return false;
        }
        self.registry.set_state(ServerState::Stopping);

        for connection in self.registry.get_copy() {
            connection.close(CloseReason::Server);
        }
        self.registry.clear();

        internal_registry::unregister(&self.local_id);

        self.registry.set_state(ServerState::Stopped);
        debug!(self.core.log, "server stopped"; "local_id" => %self.local_id);
        true
    }

    pub fn send_to(&self, id: &NetworkId, packet: Box<dyn Packet>) -> bool {
        match self.registry.get(id) {
            Some(connection) => connection.send_packet(packet, self.core.config.encode_buffer_initial_size),
            None => false,
        }
    }

    /// Encodes `packet` once per connection inline, bypassing the encoder pool: offloading would
    /// buy nothing for a fan-out write and would require cloning the packet per target.
    pub fn broadcast(&self, packet: &dyn Packet) {
        for connection in self.registry.fast_iter().values() {
            connection.encode_and_send(packet, self.core.config.encode_buffer_initial_size);
        }
    }

    pub fn disconnect(&self, id: &NetworkId) -> bool {
        match self.registry.get(id) {
            Some(connection) => connection.close(CloseReason::Server),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Internal-peer equivalent of the acceptor's admit sequence (§4.F): runs
    /// `ConfigureConnection`, builds the server-side connection, and inserts it.
    fn create_internal_peer(self: &Arc<Self>, client_local_id: NetworkId, pair: Arc<Pair>) -> Option<Arc<Connection>> {
        if self.registry.state() != ServerState::Running {
            return None;
        }

        let new_id = client_local_id;

        let connection = Arc::new(Connection::new(
            new_id.clone(),
            Arc::downgrade(&self.core) as Weak<dyn ConnectionHost>,
            Box::new(InternalTransport::new(pair, 1)),
            self.core.config.connection_check_timeout_ms,
            self.core.log.clone(),
            self.core.encoder_pool.clone(),
        ));

        self.core.events.dispatch(&Event::ConfigureConnection {
            new_id,
            custom_object: connection.custom_object().clone(),
        });

        if !self.registry.add_initialized(connection.clone()) {
            return None;
        }

        Some(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Hello(String);
    impl Packet for Hello {
        fn packet_id(&self) -> i32 {
            1
        }
        fn write_data(&self, w: &mut dyn Write) -> std::io::Result<()> {
            w.write_all(self.0.as_bytes())
        }
        fn read_data(&mut self, r: &mut dyn Read) -> std::io::Result<()> {
            let mut buf = String::new();
            r.read_to_string(&mut buf)?;
            self.0 = buf;
            Ok(())
        }
    }

    #[test]
    fn loopback_round_trip() {
        let server_id = NetworkId::internal("loopback-test-server", "loopback-test-server");
        internal_registry::unregister(&server_id);

        let server_config = ManagerConfig {
            server_type: ServerType::Internal,
            ..ManagerConfig::default()
        };
        let server = Arc::new(ServerManager::new(server_id.clone(), server_config).unwrap());
        server.mapping_container().register(1, || Hello(String::new()));

        let received = Arc::new(AtomicBool::new(false));
        let r = received.clone();
        server.add_packet_handler(Box::new(move |_source, packet, _custom_object| {
            if packet.packet_id() == 1 {
                r.store(true, Ordering::SeqCst);
            }
        }));

        assert!(server.start());

        let client = ClientManager::new(NetworkId::internal("client", "client"), server_id.clone(), ManagerConfig::default()).unwrap();
        client.mapping_container().register(1, || Hello(String::new()));

        assert!(client.open());
        assert!(client.send(Box::new(Hello("hi".to_string()))));
        assert!(received.load(Ordering::SeqCst));

        assert!(client.close());
        server.stop();
        internal_registry::unregister(&server_id);
    }
}
