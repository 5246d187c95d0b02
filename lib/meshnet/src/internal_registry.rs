//! Process-global registry of servers that opted in to accept loopback (internal) peers. A
//! client whose remote id is `Feature::Internal(name)` resolves its peer here instead of
//! opening any real transport.

use crate::manager::ServerManager;
use crate::network_id::NetworkId;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<NetworkId, Arc<ServerManager>>> = Mutex::new(HashMap::new());
}

/// Registers `server` under `id`. Succeeds iff `id` is not already registered.
pub fn register(id: NetworkId, server: Arc<ServerManager>) -> bool {
    let mut registry = REGISTRY.lock().expect("internal registry lock poisoned");
    if registry.contains_key(&id) {
        return false;
    }
    registry.insert(id, server);
    true
}

pub fn unregister(id: &NetworkId) {
    REGISTRY.lock().expect("internal registry lock poisoned").remove(id);
}

pub fn lookup(id: &NetworkId) -> Option<Arc<ServerManager>> {
    REGISTRY.lock().expect("internal registry lock poisoned").get(id).cloned()
}
