#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod acceptor;
pub mod coder_pool;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod internal_registry;
pub mod manager;
pub mod network_id;
pub mod packet;
pub mod server_registry;
pub mod timer;
pub mod transport;
pub mod wire;

pub use coder_pool::CoderPool;
pub use config::{ManagerConfig, ServerType, TransportKind};
pub use connection::{CloseReason, Connection, ConnectionState, CustomObjectSlot};
pub use events::{Event, EventHandler};
pub use manager::{ClientManager, ServerManager};
pub use network_id::NetworkId;
pub use packet::{Packet, PacketFactory, PacketIdMappingProvider};

pub use netsupport::{ErrorKind, NetworkError, NetworkResult};
