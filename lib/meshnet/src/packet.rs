//! The opaque packet abstraction the core moves around without ever looking inside. Everything
//! about serialization is the hosting application's concern; the core only needs an id to route
//! on the wire, a size hint for the encoder, and a pair of raw read/write hooks.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};

/// A single application-level message. Implementors own their own wire format; the core treats
/// the encoded body as an opaque byte blob framed by `packet_id` and `length` (see `wire::frame`).
pub trait Packet: Send {
    /// The id this packet type is registered under. Used to populate the `PACKET` record header.
    fn packet_id(&self) -> i32;

    /// A size hint in bytes for the encoder's output buffer. A negative value means "unknown",
    /// telling the encoder to start from `encode_buffer_initial_size` and grow as needed.
    fn byte_size(&self) -> i32 {
        -1
    }

    fn write_data(&self, writer: &mut dyn Write) -> io::Result<()>;
    fn read_data(&mut self, reader: &mut dyn Read) -> io::Result<()>;
}

impl fmt::Debug for dyn Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet(id={})", self.packet_id())
    }
}

struct Mapping {
    type_id: TypeId,
    factory: Box<dyn Fn() -> Box<dyn Packet> + Send + Sync>,
}

struct Inner {
    by_id: HashMap<i32, Mapping>,
    known_types: std::collections::HashSet<TypeId>,
}

/// Read-only (from the core's perspective) container mapping packet ids to factories. The
/// hosting application populates it once up front; the core only ever calls `create`.
/// Registration takes `&self` (guarded by an internal lock) so a manager can expose the same
/// provider for registration both before and after connections referencing it exist.
pub struct PacketIdMappingProvider {
    inner: std::sync::RwLock<Inner>,
}

impl Default for PacketIdMappingProvider {
    fn default() -> PacketIdMappingProvider {
        PacketIdMappingProvider::new()
    }
}

impl PacketIdMappingProvider {
    pub fn new() -> PacketIdMappingProvider {
        PacketIdMappingProvider {
            inner: std::sync::RwLock::new(Inner {
                by_id: HashMap::new(),
                known_types: std::collections::HashSet::new(),
            }),
        }
    }

    /// Registers a packet type under `id`, constructed via `factory` when a `PACKET` record with
    /// a matching id is decoded off the wire. Returns `false` (and registers nothing) if `id` is
    /// already mapped, or if `T` is already mapped under a different id.
    pub fn register<T, F>(&self, id: i32, factory: F) -> bool
    where
        T: Packet + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let mut inner = self.inner.write().expect("packet mapping lock poisoned");

        if inner.by_id.contains_key(&id) || inner.known_types.contains(&type_id) {
            return false;
        }

        inner.by_id.insert(
            id,
            Mapping {
                type_id,
                factory: Box::new(move || Box::new(factory()) as Box<dyn Packet>),
            },
        );
        inner.known_types.insert(type_id);

        true
    }

    /// Instantiates a fresh packet for `id`, or `None` if `id` has no registered mapping.
    #[inline]
    pub fn create(&self, id: i32) -> Option<Box<dyn Packet>> {
        let inner = self.inner.read().expect("packet mapping lock poisoned");
        inner.by_id.get(&id).map(|mapping| (mapping.factory)())
    }

    #[inline]
    pub fn contains(&self, id: i32) -> bool {
        self.inner.read().expect("packet mapping lock poisoned").by_id.contains_key(&id)
    }
}

/// Convenience alias matching the "factory" vocabulary used in the external interface.
pub trait PacketFactory<T: Packet> {
    fn create(&self) -> T;
}

impl<T: Packet, F: Fn() -> T> PacketFactory<T> for F {
    #[inline]
    fn create(&self) -> T {
        self()
    }
}
