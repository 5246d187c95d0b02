//! The map of live connections a running server owns, plus the server's own lifecycle state.
//! Guarded by a single readers-writer lock so broadcasts (`fast_iter`) and single-connection
//! lookups can proceed concurrently.

use crate::connection::Connection;
use crate::network_id::NetworkId;
use indexmap::IndexMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// `Initialized → Starting → Running → Stopping → Stopped`, absorbing at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct ServerRegistry {
    state: RwLock<ServerState>,
    connections: RwLock<IndexMap<NetworkId, Arc<Connection>>>,
}

impl ServerRegistry {
    pub fn new() -> ServerRegistry {
        ServerRegistry {
            state: RwLock::new(ServerState::Initialized),
            connections: RwLock::new(IndexMap::new()),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.read().expect("server registry state lock poisoned")
    }

    pub fn set_state(&self, state: ServerState) {
        *self.state.write().expect("server registry state lock poisoned") = state;
    }

    /// Accepted only while `Running`; rejects a duplicate id (by description, see
    /// `NetworkId`'s equality) without disturbing the existing entry.
    pub fn add_initialized(&self, connection: Arc<Connection>) -> bool {
        if self.state() != ServerState::Running {
            return false;
        }

        let mut connections = self.connections.write().expect("server registry connections lock poisoned");
        if connections.contains_key(connection.remote_id()) {
            return false;
        }

        connections.insert(connection.remote_id().clone(), connection);
        true
    }

    /// Removes an entry without posting any event. Called from `Connection::close`'s own path
    /// so the registry and the `ConnectionClosed` event never race.
    pub fn remove_silently(&self, id: &NetworkId) {
        self.connections.write().expect("server registry connections lock poisoned").shift_remove(id);
    }

    pub fn get(&self, id: &NetworkId) -> Option<Arc<Connection>> {
        self.connections.read().expect("server registry connections lock poisoned").get(id).cloned()
    }

    pub fn get_copy(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .expect("server registry connections lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Iterates under the read lock. The guard must be held by the caller for the duration of
    /// the iteration, mirroring the "requires caller holds the read lock" contract.
    pub fn fast_iter(&self) -> RwLockReadGuard<'_, IndexMap<NetworkId, Arc<Connection>>> {
        self.connections.read().expect("server registry connections lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("server registry connections lock poisoned").len()
    }

    pub fn clear(&self) {
        self.connections.write().expect("server registry connections lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coder_pool::CoderPool;
    use crate::connection::{ConnectionHost, CustomObjectSlot};
    use crate::events::Event;
    use crate::packet::Packet;
    use crate::transport::NullTransport;
    use netsupport::logging;
    use std::sync::Weak;

    struct NoopHost;
    impl ConnectionHost for NoopHost {
        fn dispatch_packet(&self, _source: &NetworkId, _packet: Box<dyn Packet>, _custom_object: &Arc<CustomObjectSlot>) {}
        fn post_event(&self, _event: Event) {}
        fn remove_silently(&self, _id: &NetworkId) {}
        fn log(&self) -> &logging::Logger {
            unimplemented!()
        }
    }

    fn connection(description: &str) -> Arc<Connection> {
        let host: Weak<dyn ConnectionHost> = Weak::<NoopHost>::new();
        Arc::new(Connection::new(
            NetworkId::bind(description, 1),
            host,
            Box::new(NullTransport::default()),
            30_000,
            logging::discard(),
            Arc::new(CoderPool::new(0)),
        ))
    }

    #[test]
    fn add_requires_running() {
        let registry = ServerRegistry::new();
        assert!(!registry.add_initialized(connection("A")));

        registry.set_state(ServerState::Running);
        assert!(registry.add_initialized(connection("A")));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = ServerRegistry::new();
        registry.set_state(ServerState::Running);

        assert!(registry.add_initialized(connection("A")));
        assert!(!registry.add_initialized(connection("A")));
        assert_eq!(registry.len(), 1);
    }
}
