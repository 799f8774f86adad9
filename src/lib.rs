// ============================================================================
// Passthrough Server Library
// ============================================================================
//
// In-process simulation of a clustered server stripe: an active process
// hosting entities behind per-entity read/write locks, optionally feeding a
// passive process that mirrors it and can be promoted on fail-over.
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod entity;
pub mod lock;
pub mod monitoring;
pub mod prelude;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export main types for convenience
pub use crate::core::{
    ClientDescriptor, ConcurrencyKey, ConsumerId, EntityError, EntityTuple, PLATFORM_CONSUMER_ID,
    Result, ServerError, ServerRole,
};
pub use server::{EntitySummary, ProcessSnapshot, ServerConfig, ServerProcess};

// Re-export the client side
pub use connection::{ClientConnection, MessageSender};
pub use protocol::{ReplyFrame, RequestFrame, ServerMessage};

// Re-export persistence and monitoring adapters
pub use monitoring::{MonitoringProducer, MonitoringTree, PlatformNode};
pub use storage::{EntityData, EntityStore, FileEntityStore, MemoryEntityStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_accepts_nothing_before_start() {
        let server = ServerProcess::new(ServerConfig::active("idle")).unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.connect(1), Err(ServerError::NotRunning)));
    }

    #[test]
    fn test_start_and_shutdown() {
        let tree = std::sync::Arc::new(MonitoringTree::new());
        let mut server =
            ServerProcess::new(ServerConfig::passive("standby").monitoring(tree.clone())).unwrap();
        server.start().unwrap();
        assert_eq!(tree.server_state().as_deref(), Some("PASSIVE"));
        server.shutdown().unwrap();
        assert_eq!(tree.server_state().as_deref(), Some("STOPPED"));
        assert!(matches!(server.shutdown(), Err(ServerError::NotRunning)));
    }
}
