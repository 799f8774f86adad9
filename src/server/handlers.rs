use super::state::{EntityOrigin, EntityRecord, EntityTable, LockContinuation, ProcessState};
use crate::connection::MessageSender;
use crate::core::{ConcurrencyKey, ConsumerId, EntityError, EntityTuple, invariant_violation};
use crate::entity::{BoxedActiveEntity, BoxedPassiveEntity};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type EntityResult<T> = std::result::Result<T, EntityError>;

/// Receives the outcome of a fetch once its read lock was granted.
pub(crate) type FetchCallback = Box<dyn FnOnce(EntityResult<Vec<u8>>) + Send>;

fn not_found(entity: &EntityTuple) -> EntityError {
    EntityError::not_found(&entity.type_name, &entity.name)
}

impl ProcessState {
    fn active_entities(
        &mut self,
        operation: &str,
    ) -> &mut BTreeMap<EntityTuple, EntityRecord<BoxedActiveEntity>> {
        match &mut self.entities {
            EntityTable::Active(map) => map,
            EntityTable::Passive(_) => invariant_violation(format!(
                "{} is not accepted by passive server '{}'",
                operation, self.name
            )),
        }
    }

    fn passive_entities(
        &mut self,
        operation: &str,
    ) -> &mut BTreeMap<EntityTuple, EntityRecord<BoxedPassiveEntity>> {
        match &mut self.entities {
            EntityTable::Passive(map) => map,
            EntityTable::Active(_) => invariant_violation(format!(
                "{} is not accepted by active server '{}'",
                operation, self.name
            )),
        }
    }

    fn passive_record(
        &mut self,
        operation: &str,
        entity: &EntityTuple,
    ) -> EntityResult<&mut EntityRecord<BoxedPassiveEntity>> {
        self.passive_entities(operation)
            .get_mut(entity)
            .ok_or_else(|| not_found(entity))
    }

    fn run_granted(&mut self, granted: Vec<LockContinuation>) {
        for on_acquire in granted {
            on_acquire(self);
        }
    }

    // ========================================================================
    // Entity lifecycle
    // ========================================================================

    pub(crate) fn create(
        &mut self,
        entity: &EntityTuple,
        version: u64,
        configuration: &[u8],
    ) -> EntityResult<ConsumerId> {
        if self.entities.contains(entity) {
            return Err(EntityError::already_exists(&entity.type_name, &entity.name));
        }
        let service = self.service_for_version(entity, version)?;
        let registry = self.peek_registry();
        let consumer_id = registry.consumer_id();
        self.install_entity(
            entity.clone(),
            version,
            configuration.to_vec(),
            service,
            registry,
            EntityOrigin::Created,
        )?;
        self.commit_consumer_id();
        self.persist_entity(consumer_id, entity, version, configuration);
        self.publish_entity(entity);
        debug!(server = %self.name, %entity, consumer_id, "entity created");
        Ok(consumer_id)
    }

    pub(crate) fn destroy(&mut self, entity: &EntityTuple) -> EntityResult<()> {
        let consumer_id = match &mut self.entities {
            EntityTable::Active(map) => map.remove(entity).map(|mut record| {
                record.instance.destroy();
                record.consumer_id
            }),
            EntityTable::Passive(map) => map.remove(entity).map(|mut record| {
                record.instance.destroy();
                record.consumer_id
            }),
        }
        .ok_or_else(|| not_found(entity))?;
        self.forget_entity(consumer_id, entity);
        self.unpublish_entity(entity);
        debug!(server = %self.name, %entity, consumer_id, "entity destroyed");
        Ok(())
    }

    /// Takes a read lock for the client, then connects it and hands back the
    /// entity's configuration. Waits behind a held or queued write lock.
    pub(crate) fn fetch(
        &mut self,
        sender: Arc<dyn MessageSender>,
        client_instance_id: u64,
        entity: EntityTuple,
        version: u64,
        on_fetch: FetchCallback,
    ) {
        self.active_entities("fetch");
        let origin_id = sender.client_origin_id();
        let lock_entity = entity.clone();
        let on_acquire: LockContinuation = Box::new(move |state: &mut ProcessState| {
            let result = state.complete_fetch(sender.as_ref(), client_instance_id, &entity, version);
            if result.is_err() {
                state.release_read_lock(&entity, origin_id, client_instance_id);
            }
            on_fetch(result);
        });
        match self
            .locks
            .acquire_read_lock(&lock_entity, origin_id, client_instance_id, on_acquire)
        {
            Some(granted) => granted(self),
            None => debug!(
                server = %self.name,
                entity = %lock_entity,
                origin_id,
                "fetch waiting for read lock"
            ),
        }
    }

    fn complete_fetch(
        &mut self,
        sender: &dyn MessageSender,
        client_instance_id: u64,
        entity: &EntityTuple,
        version: u64,
    ) -> EntityResult<Vec<u8>> {
        let record = self
            .active_entities("fetch")
            .get_mut(entity)
            .ok_or_else(|| not_found(entity))?;
        let expected = record.service.version();
        if expected != version {
            return Err(EntityError::version_mismatch(
                &entity.type_name,
                &entity.name,
                Some(expected),
                version,
            ));
        }
        record
            .instance
            .connected(&sender.client_descriptor_for(client_instance_id));
        let config = record.instance.config();
        self.publish_fetch(sender.client_origin_id(), entity);
        Ok(config)
    }

    pub(crate) fn release(
        &mut self,
        sender: &dyn MessageSender,
        client_instance_id: u64,
        entity: &EntityTuple,
    ) -> EntityResult<()> {
        let origin_id = sender.client_origin_id();
        let record = self
            .active_entities("release")
            .get_mut(entity)
            .ok_or_else(|| not_found(entity))?;
        record
            .instance
            .disconnected(&sender.client_descriptor_for(client_instance_id));
        self.release_read_lock(entity, origin_id, client_instance_id);
        self.unpublish_fetch(origin_id, entity);
        Ok(())
    }

    pub(crate) fn invoke(
        &mut self,
        sender: &dyn MessageSender,
        client_instance_id: u64,
        entity: &EntityTuple,
        payload: &[u8],
    ) -> EntityResult<Vec<u8>> {
        match &mut self.entities {
            EntityTable::Active(map) => {
                let record = map.get_mut(entity).ok_or_else(|| not_found(entity))?;
                record
                    .instance
                    .invoke(&sender.client_descriptor_for(client_instance_id), payload)
            }
            EntityTable::Passive(map) => {
                let record = map.get_mut(entity).ok_or_else(|| not_found(entity))?;
                record.instance.invoke(payload)?;
                Ok(Vec::new())
            }
        }
    }

    /// Re-attaches a client that fetched the entity on a previous active.
    /// Nothing else can hold a lock on the entity at that point.
    pub(crate) fn reconnect(
        &mut self,
        sender: Arc<dyn MessageSender>,
        client_instance_id: u64,
        entity: &EntityTuple,
        extended_data: Vec<u8>,
    ) {
        let origin_id = sender.client_origin_id();
        let target = entity.clone();
        let on_acquire: LockContinuation = Box::new(move |state: &mut ProcessState| {
            let client = sender.client_descriptor_for(client_instance_id);
            let Some(record) = state.active_entities("reconnect").get_mut(&target) else {
                invariant_violation(format!("reconnect to missing entity {}", target));
            };
            record.instance.connected(&client);
            record.instance.handle_reconnect(&client, &extended_data);
            state.publish_fetch(origin_id, &target);
        });
        match self
            .locks
            .acquire_read_lock(entity, origin_id, client_instance_id, on_acquire)
        {
            Some(granted) => granted(self),
            None => invariant_violation(format!(
                "reconnect of client {} to {} could not take its read lock",
                origin_id, entity
            )),
        }
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub(crate) fn release_read_lock(&mut self, entity: &EntityTuple, origin_id: u64, client_instance_id: u64) {
        match self.locks.release_read_lock(entity, origin_id, client_instance_id) {
            Ok(granted) => self.run_granted(granted),
            Err(err) => invariant_violation(err),
        }
    }

    pub(crate) fn acquire_write_lock(
        &mut self,
        origin_id: u64,
        entity: &EntityTuple,
        on_acquire: LockContinuation,
    ) {
        self.active_entities("acquire_write_lock");
        match self.locks.acquire_write_lock(entity, origin_id, on_acquire) {
            Some(granted) => granted(self),
            None => debug!(server = %self.name, %entity, origin_id, "write lock request queued"),
        }
    }

    pub(crate) fn try_acquire_write_lock(&mut self, origin_id: u64, entity: &EntityTuple) -> bool {
        self.active_entities("try_acquire_write_lock");
        self.locks.try_acquire_write_lock(entity, origin_id)
    }

    pub(crate) fn release_write_lock(&mut self, origin_id: u64, entity: &EntityTuple) {
        self.active_entities("release_write_lock");
        match self.locks.release_write_lock(entity, origin_id) {
            Ok(granted) => self.run_granted(granted),
            Err(err) => invariant_violation(err),
        }
    }

    pub(crate) fn restore_write_lock(
        &mut self,
        origin_id: u64,
        entity: &EntityTuple,
        on_acquire: LockContinuation,
    ) {
        self.active_entities("restore_write_lock");
        match self.locks.restore_write_lock(entity, origin_id, on_acquire) {
            Some(granted) => granted(self),
            None => debug!(server = %self.name, %entity, origin_id, "restored write lock waiting for holders"),
        }
    }

    // ========================================================================
    // Passive synchronization
    // ========================================================================

    /// Opens synchronization of an entity, creating it first when the
    /// passive has never seen it.
    pub(crate) fn sync_entity_start(
        &mut self,
        entity: &EntityTuple,
        version: u64,
        configuration: &[u8],
    ) -> EntityResult<()> {
        self.passive_entities("sync_entity_start");
        if !self.entities.contains(entity) {
            self.create(entity, version, configuration)?;
        }
        self.passive_record("sync_entity_start", entity)?
            .instance
            .start_sync_entity();
        Ok(())
    }

    pub(crate) fn sync_entity_end(&mut self, entity: &EntityTuple) -> EntityResult<()> {
        self.passive_record("sync_entity_end", entity)?
            .instance
            .end_sync_entity();
        Ok(())
    }

    pub(crate) fn sync_entity_key_start(&mut self, entity: &EntityTuple, key: ConcurrencyKey) -> EntityResult<()> {
        self.passive_record("sync_entity_key_start", entity)?
            .instance
            .start_sync_concurrency_key(key);
        Ok(())
    }

    pub(crate) fn sync_entity_key_end(&mut self, entity: &EntityTuple, key: ConcurrencyKey) -> EntityResult<()> {
        self.passive_record("sync_entity_key_end", entity)?
            .instance
            .end_sync_concurrency_key(key);
        Ok(())
    }

    pub(crate) fn sync_payload(
        &mut self,
        entity: &EntityTuple,
        key: ConcurrencyKey,
        payload: &[u8],
    ) -> EntityResult<()> {
        self.passive_record("sync_payload", entity)?
            .instance
            .invoke_sync_payload(key, payload)
    }

    // ========================================================================
    // Client connections
    // ========================================================================

    pub(crate) fn client_connected(&mut self, origin_id: u64) {
        debug!(server = %self.name, origin_id, "client connected");
        self.publish_client(origin_id);
    }

    pub(crate) fn client_disconnected(&mut self, origin_id: u64) {
        debug!(server = %self.name, origin_id, "client disconnected");
        self.unpublish_client(origin_id);
    }
}
