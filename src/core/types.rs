use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier handed to every consumer of platform services, entities included.
pub type ConsumerId = u64;

/// The platform registers itself as the first consumer.
pub const PLATFORM_CONSUMER_ID: ConsumerId = 0;

/// Partition of an entity's state used when synchronizing a passive.
pub type ConcurrencyKey = u32;

/// Identity of an entity: its type name plus its instance name.
///
/// This is the only key used by the entity registry and the lock manager.
/// The version is deliberately not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTuple {
    pub type_name: String,
    pub name: String,
}

impl EntityTuple {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Name of the monitoring node published for this entity.
    pub fn identifier(&self) -> String {
        format!("{}{}", self.type_name, self.name)
    }
}

impl fmt::Display for EntityTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.name)
    }
}

/// One fetch session of one entity by one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub origin_id: u64,
    pub instance_id: u64,
}

impl ClientDescriptor {
    pub fn new(origin_id: u64, instance_id: u64) -> Self {
        Self {
            origin_id,
            instance_id,
        }
    }
}

/// Role a server process plays in its stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    Active,
    Passive,
}

impl ServerRole {
    pub fn is_active(&self) -> bool {
        matches!(self, ServerRole::Active)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Active => write!(f, "active"),
            ServerRole::Passive => write!(f, "passive"),
        }
    }
}
