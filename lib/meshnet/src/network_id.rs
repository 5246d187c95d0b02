//! Opaque peer addressing. See `Feature` for the three supported address shapes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Selects which optional attribute a `NetworkId` carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    /// A loopback peer registered under `name` in the process-wide internal registry.
    Internal(String),
    /// A server listening address.
    Bind(u16),
    /// A remote peer reachable at `addr`.
    Connect(SocketAddr),
}

/// Immutable peer identity. Equality and hashing are defined *by description only* — the
/// library does not enforce uniqueness of descriptions within a registry, callers must.
#[derive(Debug, Clone)]
pub struct NetworkId {
    description: String,
    feature: Feature,
}

impl NetworkId {
    #[inline]
    pub fn new(description: impl Into<String>, feature: Feature) -> NetworkId {
        NetworkId {
            description: description.into(),
            feature,
        }
    }

    #[inline]
    pub fn internal(description: impl Into<String>, name: impl Into<String>) -> NetworkId {
        NetworkId::new(description, Feature::Internal(name.into()))
    }

    #[inline]
    pub fn bind(description: impl Into<String>, port: u16) -> NetworkId {
        NetworkId::new(description, Feature::Bind(port))
    }

    #[inline]
    pub fn connect(description: impl Into<String>, addr: SocketAddr) -> NetworkId {
        NetworkId::new(description, Feature::Connect(addr))
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn feature(&self) -> &Feature {
        &self.feature
    }

    /// Clones this id, replacing its description. Used by the acceptor when a filter handler
    /// renames a newly accepted connection.
    #[inline]
    pub fn with_description(&self, description: impl Into<String>) -> NetworkId {
        NetworkId {
            description: description.into(),
            feature: self.feature.clone(),
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.description, self.feature)
    }
}

impl PartialEq for NetworkId {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.description == other.description
    }
}

impl Eq for NetworkId {}

impl Hash for NetworkId {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.description.hash(state);
    }
}
