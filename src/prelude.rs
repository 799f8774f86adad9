//! Recommended imports grouped by who is writing the code.
//!
//! `entity` is what an entity implementation needs.
//! `host` is what an embedding that runs server processes needs.

pub mod entity {
    //! Surface for entity authors.
    //!
    //! Implement `ActiveServerEntity` and `PassiveServerEntity` for the
    //! entity's two sides, then expose them through a `ServerEntityService`.
    pub use crate::core::{ClientDescriptor, ConcurrencyKey, EntityError};
    pub use crate::entity::{
        ActiveServerEntity, BoxedActiveEntity, BoxedPassiveEntity, CodecError, CommonServerEntity,
        MessageCodec, PassiveServerEntity, PassiveSynchronizationChannel, SerdeCodec,
        ServerEntityService, ServiceRegistry,
    };
}

pub mod host {
    //! Surface for running processes and talking to them.
    pub use crate::{
        ClientConnection, EntityTuple, FileEntityStore, MemoryEntityStore, MonitoringTree,
        ServerConfig, ServerProcess, ServerRole,
    };
    pub use crate::entity::{ServiceProvider, SharedServiceProvider};
}
