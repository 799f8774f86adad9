// ============================================================================
// Server Wire Protocol
// ============================================================================
//
// Requests and replies travel as MessagePack frames. Every request frame is
// answered, in order, by:
//   Ack       as soon as the server starts processing it
//   Complete  once the operation finished (possibly after a lock grant)
//   Retire    once the server is done with it
//
// ============================================================================

use crate::core::{ConcurrencyKey, EntityError, EntityTuple, Result, ServerError};
use serde::{Deserialize, Serialize};

/// Operations a server process accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Create {
        entity: EntityTuple,
        version: u64,
        configuration: Vec<u8>,
    },
    Destroy {
        entity: EntityTuple,
    },
    Fetch {
        entity: EntityTuple,
        client_instance_id: u64,
        version: u64,
    },
    Release {
        entity: EntityTuple,
        client_instance_id: u64,
    },
    Invoke {
        entity: EntityTuple,
        client_instance_id: u64,
        payload: Vec<u8>,
    },
    AcquireWriteLock {
        entity: EntityTuple,
    },
    TryAcquireWriteLock {
        entity: EntityTuple,
    },
    ReleaseWriteLock {
        entity: EntityTuple,
    },
    RestoreWriteLock {
        entity: EntityTuple,
    },
    Reconnect {
        entity: EntityTuple,
        client_instance_id: u64,
        extended_data: Vec<u8>,
    },
    SyncEntityStart {
        entity: EntityTuple,
        version: u64,
        configuration: Vec<u8>,
    },
    SyncEntityEnd {
        entity: EntityTuple,
    },
    SyncEntityKeyStart {
        entity: EntityTuple,
        key: ConcurrencyKey,
    },
    SyncEntityKeyEnd {
        entity: EntityTuple,
        key: ConcurrencyKey,
    },
    SyncPayload {
        entity: EntityTuple,
        key: ConcurrencyKey,
        payload: Vec<u8>,
    },
}

impl ServerMessage {
    pub fn entity(&self) -> &EntityTuple {
        match self {
            ServerMessage::Create { entity, .. }
            | ServerMessage::Destroy { entity }
            | ServerMessage::Fetch { entity, .. }
            | ServerMessage::Release { entity, .. }
            | ServerMessage::Invoke { entity, .. }
            | ServerMessage::AcquireWriteLock { entity }
            | ServerMessage::TryAcquireWriteLock { entity }
            | ServerMessage::ReleaseWriteLock { entity }
            | ServerMessage::RestoreWriteLock { entity }
            | ServerMessage::Reconnect { entity, .. }
            | ServerMessage::SyncEntityStart { entity, .. }
            | ServerMessage::SyncEntityEnd { entity }
            | ServerMessage::SyncEntityKeyStart { entity, .. }
            | ServerMessage::SyncEntityKeyEnd { entity, .. }
            | ServerMessage::SyncPayload { entity, .. } => entity,
        }
    }

    /// Operations an active forwards to its downstream passive.
    pub fn is_replicated(&self) -> bool {
        matches!(
            self,
            ServerMessage::Create { .. } | ServerMessage::Destroy { .. } | ServerMessage::Invoke { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Create { .. } => "create",
            ServerMessage::Destroy { .. } => "destroy",
            ServerMessage::Fetch { .. } => "fetch",
            ServerMessage::Release { .. } => "release",
            ServerMessage::Invoke { .. } => "invoke",
            ServerMessage::AcquireWriteLock { .. } => "acquire_write_lock",
            ServerMessage::TryAcquireWriteLock { .. } => "try_acquire_write_lock",
            ServerMessage::ReleaseWriteLock { .. } => "release_write_lock",
            ServerMessage::RestoreWriteLock { .. } => "restore_write_lock",
            ServerMessage::Reconnect { .. } => "reconnect",
            ServerMessage::SyncEntityStart { .. } => "sync_entity_start",
            ServerMessage::SyncEntityEnd { .. } => "sync_entity_end",
            ServerMessage::SyncEntityKeyStart { .. } => "sync_entity_key_start",
            ServerMessage::SyncEntityKeyEnd { .. } => "sync_entity_key_end",
            ServerMessage::SyncPayload { .. } => "sync_payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub transaction_id: u64,
    pub message: ServerMessage,
}

impl RequestFrame {
    pub fn new(transaction_id: u64, message: ServerMessage) -> Self {
        Self {
            transaction_id,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self)
            .map_err(|e| ServerError::Protocol(format!("Failed to encode request: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ServerError::Protocol(format!("Failed to decode request: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyFrame {
    Ack {
        transaction_id: u64,
    },
    Complete {
        transaction_id: u64,
        result: std::result::Result<Vec<u8>, EntityError>,
    },
    Retire {
        transaction_id: u64,
    },
}

impl ReplyFrame {
    pub fn transaction_id(&self) -> u64 {
        match self {
            ReplyFrame::Ack { transaction_id }
            | ReplyFrame::Complete { transaction_id, .. }
            | ReplyFrame::Retire { transaction_id } => *transaction_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self)
            .map_err(|e| ServerError::Protocol(format!("Failed to encode reply: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| ServerError::Protocol(format!("Failed to decode reply: {}", e)))
    }
}

/// Encodes the boolean answer of a try-acquire.
pub fn encode_flag(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

pub fn decode_flag(payload: &[u8]) -> Result<bool> {
    match payload {
        [0] => Ok(false),
        [1] => Ok(true),
        other => Err(ServerError::Protocol(format!(
            "Expected a one-byte flag, got {} bytes",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_carries_entity_errors() {
        let reply = ReplyFrame::Complete {
            transaction_id: 9,
            result: Err(EntityError::not_found("Cache", "orders")),
        };
        let decoded = ReplyFrame::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.transaction_id(), 9);
    }

    #[test]
    fn test_garbage_request_is_a_protocol_error() {
        assert!(matches!(
            RequestFrame::decode(b"not a frame"),
            Err(ServerError::Protocol(_))
        ));
    }

    #[test]
    fn test_only_state_changes_replicate() {
        let entity = EntityTuple::new("Cache", "orders");
        assert!(ServerMessage::Destroy { entity: entity.clone() }.is_replicated());
        assert!(
            !ServerMessage::Fetch {
                entity: entity.clone(),
                client_instance_id: 1,
                version: 1
            }
            .is_replicated()
        );
        assert!(!ServerMessage::AcquireWriteLock { entity }.is_replicated());
    }

    #[test]
    fn test_flags() {
        assert!(decode_flag(&encode_flag(true)).unwrap());
        assert!(!decode_flag(&encode_flag(false)).unwrap());
        assert!(decode_flag(&[]).is_err());
    }
}
