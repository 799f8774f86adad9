// ============================================================================
// Server Entity Contracts
// ============================================================================
//
// Entity implementations plug into the server through these traits:
// - `ActiveServerEntity` / `PassiveServerEntity`: typed entity logic
// - `ActiveEntityObject` / `PassiveEntityObject`: byte-level forms the
//   server stores, implemented for every typed entity
// - `ServerEntityService`: factory resolving a type name and version
//
// ============================================================================

pub mod codec;
pub mod service;

pub use codec::{CodecError, MessageCodec, SerdeCodec};
pub use service::{ServerEntityService, ServiceProvider, ServiceRegistry, SharedServiceProvider};

use crate::core::{ClientDescriptor, ConcurrencyKey, EntityError};

/// Lifecycle hooks shared by active and passive instances.
pub trait CommonServerEntity: Send {
    /// Called once when the entity is created by a client.
    fn create_new(&mut self) {}

    /// Called instead of `create_new` when the entity inherits prior state:
    /// reload from persistence or promotion of a passive.
    fn load_existing(&mut self) {}

    /// Called when the entity is destroyed, to release its resources.
    fn destroy(&mut self) {}
}

/// Receives the state an active entity streams for one concurrency key.
pub trait PassiveSynchronizationChannel {
    fn synchronize_to_passive(&mut self, payload: Vec<u8>);
}

pub trait ActiveServerEntity: CommonServerEntity {
    type Message;
    type Response;

    fn message_codec(&self) -> &dyn MessageCodec<Self::Message, Self::Response>;

    fn connected(&mut self, client: &ClientDescriptor);

    fn disconnected(&mut self, client: &ClientDescriptor);

    /// Current configuration handed to clients that fetch the entity.
    fn config(&self) -> Vec<u8>;

    fn invoke(&mut self, client: &ClientDescriptor, message: Self::Message) -> Self::Response;

    fn handle_reconnect(&mut self, _client: &ClientDescriptor, _extended_data: &[u8]) {}

    /// Keys to walk, in order, when synchronizing a new passive.
    fn keys_for_synchronization(&self) -> Vec<ConcurrencyKey> {
        Vec::new()
    }

    fn synchronize_key_to_passive(
        &mut self,
        _channel: &mut dyn PassiveSynchronizationChannel,
        _key: ConcurrencyKey,
    ) {
    }
}

pub trait PassiveServerEntity: CommonServerEntity {
    type Message;
    type Response;

    fn message_codec(&self) -> &dyn MessageCodec<Self::Message, Self::Response>;

    /// Applies a replicated message. Passives never answer clients.
    fn invoke(&mut self, message: Self::Message);

    fn start_sync_entity(&mut self) {}

    fn end_sync_entity(&mut self) {}

    fn start_sync_concurrency_key(&mut self, _key: ConcurrencyKey) {}

    fn end_sync_concurrency_key(&mut self, _key: ConcurrencyKey) {}
}

/// Byte-level view of an active entity, as stored by the server.
pub trait ActiveEntityObject: Send {
    fn create_new(&mut self);
    fn load_existing(&mut self);
    fn destroy(&mut self);
    fn connected(&mut self, client: &ClientDescriptor);
    fn disconnected(&mut self, client: &ClientDescriptor);
    fn handle_reconnect(&mut self, client: &ClientDescriptor, extended_data: &[u8]);
    fn config(&self) -> Vec<u8>;
    fn invoke(&mut self, client: &ClientDescriptor, payload: &[u8]) -> Result<Vec<u8>, EntityError>;
    fn keys_for_synchronization(&self) -> Vec<ConcurrencyKey>;
    fn synchronize_key_to_passive(
        &mut self,
        channel: &mut dyn PassiveSynchronizationChannel,
        key: ConcurrencyKey,
    );
}

impl<E: ActiveServerEntity> ActiveEntityObject for E {
    fn create_new(&mut self) {
        CommonServerEntity::create_new(self)
    }

    fn load_existing(&mut self) {
        CommonServerEntity::load_existing(self)
    }

    fn destroy(&mut self) {
        CommonServerEntity::destroy(self)
    }

    fn connected(&mut self, client: &ClientDescriptor) {
        ActiveServerEntity::connected(self, client)
    }

    fn disconnected(&mut self, client: &ClientDescriptor) {
        ActiveServerEntity::disconnected(self, client)
    }

    fn handle_reconnect(&mut self, client: &ClientDescriptor, extended_data: &[u8]) {
        ActiveServerEntity::handle_reconnect(self, client, extended_data)
    }

    fn config(&self) -> Vec<u8> {
        ActiveServerEntity::config(self)
    }

    fn invoke(&mut self, client: &ClientDescriptor, payload: &[u8]) -> Result<Vec<u8>, EntityError> {
        let message = ActiveServerEntity::message_codec(self).decode_message(payload)?;
        let response = ActiveServerEntity::invoke(self, client, message);
        Ok(ActiveServerEntity::message_codec(self).encode_response(&response)?)
    }

    fn keys_for_synchronization(&self) -> Vec<ConcurrencyKey> {
        ActiveServerEntity::keys_for_synchronization(self)
    }

    fn synchronize_key_to_passive(
        &mut self,
        channel: &mut dyn PassiveSynchronizationChannel,
        key: ConcurrencyKey,
    ) {
        ActiveServerEntity::synchronize_key_to_passive(self, channel, key)
    }
}

/// Byte-level view of a passive entity, as stored by the server.
pub trait PassiveEntityObject: Send {
    fn create_new(&mut self);
    fn load_existing(&mut self);
    fn destroy(&mut self);
    fn invoke(&mut self, payload: &[u8]) -> Result<(), EntityError>;
    fn invoke_sync_payload(&mut self, key: ConcurrencyKey, payload: &[u8]) -> Result<(), EntityError>;
    fn start_sync_entity(&mut self);
    fn end_sync_entity(&mut self);
    fn start_sync_concurrency_key(&mut self, key: ConcurrencyKey);
    fn end_sync_concurrency_key(&mut self, key: ConcurrencyKey);
}

impl<E: PassiveServerEntity> PassiveEntityObject for E {
    fn create_new(&mut self) {
        CommonServerEntity::create_new(self)
    }

    fn load_existing(&mut self) {
        CommonServerEntity::load_existing(self)
    }

    fn destroy(&mut self) {
        CommonServerEntity::destroy(self)
    }

    fn invoke(&mut self, payload: &[u8]) -> Result<(), EntityError> {
        let message = PassiveServerEntity::message_codec(self).decode_message(payload)?;
        PassiveServerEntity::invoke(self, message);
        Ok(())
    }

    fn invoke_sync_payload(&mut self, key: ConcurrencyKey, payload: &[u8]) -> Result<(), EntityError> {
        let message = PassiveServerEntity::message_codec(self).decode_sync_message(key, payload)?;
        PassiveServerEntity::invoke(self, message);
        Ok(())
    }

    fn start_sync_entity(&mut self) {
        PassiveServerEntity::start_sync_entity(self)
    }

    fn end_sync_entity(&mut self) {
        PassiveServerEntity::end_sync_entity(self)
    }

    fn start_sync_concurrency_key(&mut self, key: ConcurrencyKey) {
        PassiveServerEntity::start_sync_concurrency_key(self, key)
    }

    fn end_sync_concurrency_key(&mut self, key: ConcurrencyKey) {
        PassiveServerEntity::end_sync_concurrency_key(self, key)
    }
}

pub type BoxedActiveEntity = Box<dyn ActiveEntityObject>;
pub type BoxedPassiveEntity = Box<dyn PassiveEntityObject>;
