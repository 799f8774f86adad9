use super::sync::PassiveLink;
use crate::core::{
    ConsumerId, EntityError, EntityTuple, PLATFORM_CONSUMER_ID, Result, ServerError, ServerRole,
    invariant_violation,
};
use crate::entity::{BoxedActiveEntity, BoxedPassiveEntity, ServerEntityService, ServiceProvider, ServiceRegistry};
use crate::lock::LockManager;
use crate::monitoring::{
    CLIENTS_PATH, CLIENTS_ROOT_NAME, ENTITIES_PATH, ENTITIES_ROOT_NAME, FETCHED_PATH,
    FETCHED_ROOT_NAME, MonitoringProducer, PLATFORM_PATH, PLATFORM_ROOT_NAME, PlatformNode,
    SERVER_STATE_ACTIVE, SERVER_STATE_PASSIVE, SERVER_STATE_STOPPED, STATE_NODE_NAME,
};
use crate::storage::{EntityData, EntityStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Continuation queued behind a lock request. Runs on the worker once the
/// lock is granted.
pub(crate) type LockContinuation = Box<dyn FnOnce(&mut ProcessState) + Send>;

struct PersistedEntity {
    consumer_id: ConsumerId,
    entity: EntityTuple,
    version: u64,
    configuration: Vec<u8>,
    service: Arc<dyn ServerEntityService>,
}

pub(crate) struct EntityRecord<E> {
    pub(crate) entity: EntityTuple,
    pub(crate) version: u64,
    pub(crate) configuration: Vec<u8>,
    pub(crate) consumer_id: ConsumerId,
    pub(crate) service: Arc<dyn ServerEntityService>,
    pub(crate) registry: ServiceRegistry,
    pub(crate) instance: E,
}

impl<E> EntityRecord<E> {
    fn with_instance<F>(self, instance: F) -> EntityRecord<F> {
        EntityRecord {
            entity: self.entity,
            version: self.version,
            configuration: self.configuration,
            consumer_id: self.consumer_id,
            service: self.service,
            registry: self.registry,
            instance,
        }
    }

    fn summary(&self) -> EntitySummary {
        EntitySummary {
            entity: self.entity.clone(),
            version: self.version,
            consumer_id: self.consumer_id,
            configuration: self.configuration.clone(),
        }
    }
}

/// Live entities of one process. A process holds only one kind at a time.
pub(crate) enum EntityTable {
    Active(BTreeMap<EntityTuple, EntityRecord<BoxedActiveEntity>>),
    Passive(BTreeMap<EntityTuple, EntityRecord<BoxedPassiveEntity>>),
}

impl EntityTable {
    fn for_role(role: ServerRole) -> Self {
        match role {
            ServerRole::Active => EntityTable::Active(BTreeMap::new()),
            ServerRole::Passive => EntityTable::Passive(BTreeMap::new()),
        }
    }

    pub(crate) fn role(&self) -> ServerRole {
        match self {
            EntityTable::Active(_) => ServerRole::Active,
            EntityTable::Passive(_) => ServerRole::Passive,
        }
    }

    pub(crate) fn contains(&self, entity: &EntityTuple) -> bool {
        match self {
            EntityTable::Active(map) => map.contains_key(entity),
            EntityTable::Passive(map) => map.contains_key(entity),
        }
    }

    fn summaries(&self) -> Vec<EntitySummary> {
        match self {
            EntityTable::Active(map) => map.values().map(EntityRecord::summary).collect(),
            EntityTable::Passive(map) => map.values().map(EntityRecord::summary).collect(),
        }
    }
}

/// How a newly installed instance came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityOrigin {
    Created,
    Loaded,
}

/// Point-in-time view of a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub role: ServerRole,
    /// Consumer holding the platform's own service registry, once started
    pub platform_consumer_id: Option<ConsumerId>,
    /// Live entities ordered by type name, then name
    pub entities: Vec<EntitySummary>,
    pub next_consumer_id: ConsumerId,
    pub has_downstream_passive: bool,
}

impl ProcessSnapshot {
    pub fn entity(&self, entity: &EntityTuple) -> Option<&EntitySummary> {
        self.entities.iter().find(|summary| &summary.entity == entity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary {
    pub entity: EntityTuple,
    pub version: u64,
    pub consumer_id: ConsumerId,
    pub configuration: Vec<u8>,
}

/// Everything the worker owns. Only ever touched from the worker thread
/// while the process runs.
pub(crate) struct ProcessState {
    pub(crate) name: String,
    pub(crate) entities: EntityTable,
    services: Vec<Arc<dyn ServerEntityService>>,
    providers: Arc<Vec<Arc<dyn ServiceProvider>>>,
    pub(crate) locks: LockManager<LockContinuation>,
    next_consumer_id: ConsumerId,
    platform_registry: Option<ServiceRegistry>,
    store: Option<Arc<dyn EntityStore>>,
    monitoring: Option<Arc<dyn MonitoringProducer>>,
    pub(crate) downstream: Option<PassiveLink>,
}

impl ProcessState {
    pub(crate) fn new(
        name: String,
        role: ServerRole,
        store: Option<Arc<dyn EntityStore>>,
        monitoring: Option<Arc<dyn MonitoringProducer>>,
    ) -> Self {
        Self {
            name,
            entities: EntityTable::for_role(role),
            services: Vec::new(),
            providers: Arc::new(Vec::new()),
            locks: LockManager::new(),
            next_consumer_id: PLATFORM_CONSUMER_ID,
            platform_registry: None,
            store,
            monitoring,
            downstream: None,
        }
    }

    pub(crate) fn role(&self) -> ServerRole {
        self.entities.role()
    }

    pub(crate) fn register_service(&mut self, service: Arc<dyn ServerEntityService>) {
        self.services.push(service);
    }

    pub(crate) fn register_provider(&mut self, provider: Arc<dyn ServiceProvider>) {
        Arc::make_mut(&mut self.providers).push(provider);
    }

    /// One-time preparation before the worker first runs: persisted entities
    /// are read and checked first, then the platform registry and monitoring
    /// roots are set up and the entities reloaded. A failure while reading
    /// or checking leaves the state untouched.
    pub(crate) fn start_up(&mut self, load_storage: bool) -> Result<()> {
        let persisted = match self.store.clone() {
            Some(store) if load_storage => {
                store.open()?;
                Some(self.resolve_persisted(store.entries()?)?)
            }
            Some(store) => {
                store.create()?;
                None
            }
            None if load_storage => {
                return Err(ServerError::Config(
                    "load_storage requires a persistence adapter".to_string(),
                ));
            }
            None => None,
        };

        let platform = self.allocate_registry();
        debug!(
            server = %self.name,
            consumer_id = platform.consumer_id(),
            "platform service registry allocated"
        );
        self.platform_registry = Some(platform);
        self.publish_roots();

        if let Some(persisted) = persisted {
            self.reload_entities(persisted)?;
        }
        Ok(())
    }

    pub(crate) fn platform_registry_allocated(&self) -> bool {
        self.platform_registry.is_some()
    }

    /// Pairs every persisted entity with the service that will host it.
    fn resolve_persisted(&self, entries: Vec<(ConsumerId, EntityData)>) -> Result<Vec<PersistedEntity>> {
        entries
            .into_iter()
            .map(|(consumer_id, data)| -> Result<PersistedEntity> {
                let entity = EntityTuple::new(data.type_name, data.name);
                let service = self.service_for_version(&entity, data.version)?;
                Ok(PersistedEntity {
                    consumer_id,
                    entity,
                    version: data.version,
                    configuration: data.configuration,
                    service,
                })
            })
            .collect()
    }

    fn reload_entities(&mut self, persisted: Vec<PersistedEntity>) -> Result<()> {
        let count = persisted.len();
        for PersistedEntity {
            consumer_id,
            entity,
            version,
            configuration,
            service,
        } in persisted
        {
            let registry = ServiceRegistry::new(consumer_id, self.providers.clone());
            self.install_entity(
                entity.clone(),
                version,
                configuration,
                service,
                registry,
                EntityOrigin::Loaded,
            )?;
            self.publish_entity(&entity);
            if consumer_id >= self.next_consumer_id {
                self.next_consumer_id = consumer_id + 1;
            }
            debug!(server = %self.name, %entity, consumer_id, "entity reloaded");
        }
        info!(
            server = %self.name,
            count,
            next_consumer_id = self.next_consumer_id,
            "persisted entities reloaded"
        );
        Ok(())
    }

    fn allocate_registry(&mut self) -> ServiceRegistry {
        let registry = ServiceRegistry::new(self.next_consumer_id, self.providers.clone());
        self.next_consumer_id += 1;
        registry
    }

    /// Registry for the next consumer. The id is only committed by
    /// [`Self::commit_consumer_id`] once the consumer exists.
    pub(crate) fn peek_registry(&self) -> ServiceRegistry {
        ServiceRegistry::new(self.next_consumer_id, self.providers.clone())
    }

    pub(crate) fn commit_consumer_id(&mut self) {
        self.next_consumer_id += 1;
    }

    pub(crate) fn service_for_type(&self, type_name: &str) -> Option<Arc<dyn ServerEntityService>> {
        self.services
            .iter()
            .find(|service| service.handles_entity_type(type_name))
            .cloned()
    }

    pub(crate) fn service_for_version(
        &self,
        entity: &EntityTuple,
        version: u64,
    ) -> std::result::Result<Arc<dyn ServerEntityService>, EntityError> {
        match self.service_for_type(&entity.type_name) {
            Some(service) if service.version() == version => Ok(service),
            Some(service) => Err(EntityError::version_mismatch(
                &entity.type_name,
                &entity.name,
                Some(service.version()),
                version,
            )),
            None => Err(EntityError::version_mismatch(
                &entity.type_name,
                &entity.name,
                None,
                version,
            )),
        }
    }

    /// Builds the instance for this process's role, runs its birth hook and
    /// stores it.
    pub(crate) fn install_entity(
        &mut self,
        entity: EntityTuple,
        version: u64,
        configuration: Vec<u8>,
        service: Arc<dyn ServerEntityService>,
        registry: ServiceRegistry,
        origin: EntityOrigin,
    ) -> std::result::Result<(), EntityError> {
        let consumer_id = registry.consumer_id();
        match &mut self.entities {
            EntityTable::Active(map) => {
                let mut instance = service.create_active_entity(registry.clone(), &configuration)?;
                match origin {
                    EntityOrigin::Created => instance.create_new(),
                    EntityOrigin::Loaded => instance.load_existing(),
                }
                map.insert(
                    entity.clone(),
                    EntityRecord {
                        entity,
                        version,
                        configuration,
                        consumer_id,
                        service,
                        registry,
                        instance,
                    },
                );
            }
            EntityTable::Passive(map) => {
                let mut instance = service.create_passive_entity(registry.clone(), &configuration)?;
                match origin {
                    EntityOrigin::Created => instance.create_new(),
                    EntityOrigin::Loaded => instance.load_existing(),
                }
                map.insert(
                    entity.clone(),
                    EntityRecord {
                        entity,
                        version,
                        configuration,
                        consumer_id,
                        service,
                        registry,
                        instance,
                    },
                );
            }
        }
        Ok(())
    }

    /// Turns every passive instance into an active one built from the same
    /// configuration, then starts accepting active-only operations.
    pub(crate) fn promote_to_active(&mut self) {
        let EntityTable::Passive(passives) =
            std::mem::replace(&mut self.entities, EntityTable::Active(BTreeMap::new()))
        else {
            invariant_violation(format!("server '{}' is already active", self.name));
        };
        self.downstream = None;

        let mut actives = BTreeMap::new();
        for (entity, record) in passives {
            let mut instance =
                match record.service.create_active_entity(record.registry.clone(), &record.configuration) {
                    Ok(instance) => instance,
                    Err(err) => invariant_violation(format!("failed to promote {}: {}", entity, err)),
                };
            instance.load_existing();
            actives.insert(entity, record.with_instance(instance));
        }
        let promoted: Vec<EntityTuple> = actives.keys().cloned().collect();
        self.entities = EntityTable::Active(actives);

        for entity in &promoted {
            self.publish_entity(entity);
        }
        self.publish_server_state(SERVER_STATE_ACTIVE);
        info!(server = %self.name, entities = promoted.len(), "promoted to active");
    }

    pub(crate) fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            role: self.role(),
            platform_consumer_id: self.platform_registry.as_ref().map(ServiceRegistry::consumer_id),
            entities: self.entities.summaries(),
            next_consumer_id: self.next_consumer_id,
            has_downstream_passive: self.downstream.is_some(),
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub(crate) fn persist_entity(&self, consumer_id: ConsumerId, entity: &EntityTuple, version: u64, configuration: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        let data = EntityData {
            type_name: entity.type_name.clone(),
            version,
            name: entity.name.clone(),
            configuration: configuration.to_vec(),
        };
        if let Err(err) = store.put(consumer_id, data) {
            invariant_violation(format!("failed to persist {} as consumer {}: {}", entity, consumer_id, err));
        }
    }

    pub(crate) fn forget_entity(&self, consumer_id: ConsumerId, entity: &EntityTuple) {
        let Some(store) = &self.store else {
            return;
        };
        match store.remove(consumer_id) {
            Ok(true) => {}
            Ok(false) => invariant_violation(format!(
                "{} (consumer {}) was never persisted",
                entity, consumer_id
            )),
            Err(err) => invariant_violation(format!("failed to remove {} from storage: {}", entity, err)),
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    fn publish_roots(&self) {
        let Some(sink) = &self.monitoring else {
            return;
        };
        sink.add_node(&[], PLATFORM_ROOT_NAME, None);
        sink.add_node(PLATFORM_PATH, CLIENTS_ROOT_NAME, None);
        sink.add_node(PLATFORM_PATH, ENTITIES_ROOT_NAME, None);
        sink.add_node(PLATFORM_PATH, FETCHED_ROOT_NAME, None);
        self.publish_server_state(SERVER_STATE_STOPPED);
    }

    pub(crate) fn publish_server_state(&self, state: &str) {
        if let Some(sink) = &self.monitoring {
            sink.add_node(
                PLATFORM_PATH,
                STATE_NODE_NAME,
                Some(PlatformNode::ServerState(state.to_string())),
            );
        }
    }

    pub(crate) fn publish_running_state(&self) {
        match self.role() {
            ServerRole::Active => self.publish_server_state(SERVER_STATE_ACTIVE),
            ServerRole::Passive => self.publish_server_state(SERVER_STATE_PASSIVE),
        }
    }

    pub(crate) fn publish_entity(&self, entity: &EntityTuple) {
        if let Some(sink) = &self.monitoring {
            let node = PlatformNode::Entity {
                type_name: entity.type_name.clone(),
                name: entity.name.clone(),
                is_active: self.role().is_active(),
            };
            sink.add_node(ENTITIES_PATH, &entity.identifier(), Some(node));
        }
    }

    pub(crate) fn unpublish_entity(&self, entity: &EntityTuple) {
        if let Some(sink) = &self.monitoring {
            sink.remove_node(ENTITIES_PATH, &entity.identifier());
        }
    }

    pub(crate) fn publish_client(&self, origin_id: u64) {
        if let Some(sink) = &self.monitoring {
            sink.add_node(
                CLIENTS_PATH,
                &origin_id.to_string(),
                Some(PlatformNode::ConnectedClient { client_id: origin_id }),
            );
        }
    }

    pub(crate) fn unpublish_client(&self, origin_id: u64) {
        if let Some(sink) = &self.monitoring {
            sink.remove_node(CLIENTS_PATH, &origin_id.to_string());
        }
    }

    pub(crate) fn publish_fetch(&self, origin_id: u64, entity: &EntityTuple) {
        if let Some(sink) = &self.monitoring {
            let client_identifier = origin_id.to_string();
            let entity_identifier = entity.identifier();
            let name = fetch_identifier(&client_identifier, &entity_identifier);
            let node = PlatformNode::FetchedEntity {
                client_identifier,
                entity_identifier,
            };
            sink.add_node(FETCHED_PATH, &name, Some(node));
        }
    }

    pub(crate) fn unpublish_fetch(&self, origin_id: u64, entity: &EntityTuple) {
        if let Some(sink) = &self.monitoring {
            let name = fetch_identifier(&origin_id.to_string(), &entity.identifier());
            sink.remove_node(FETCHED_PATH, &name);
        }
    }
}

/// Name of the node recording that a client fetched an entity.
pub fn fetch_identifier(client_identifier: &str, entity_identifier: &str) -> String {
    format!("{}{}", client_identifier, entity_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MonitoringTree;
    use crate::storage::MemoryEntityStore;

    fn state(role: ServerRole, sink: Option<Arc<MonitoringTree>>) -> ProcessState {
        let monitoring = sink.map(|tree| tree as Arc<dyn MonitoringProducer>);
        ProcessState::new("unit".to_string(), role, Some(Arc::new(MemoryEntityStore::new())), monitoring)
    }

    #[test]
    fn test_start_up_reserves_platform_consumer() {
        let mut state = state(ServerRole::Active, None);
        state.start_up(false).unwrap();
        assert_eq!(state.snapshot().next_consumer_id, PLATFORM_CONSUMER_ID + 1);
        assert_eq!(state.peek_registry().consumer_id(), 1);
    }

    #[test]
    fn test_start_up_publishes_roots() {
        let tree = Arc::new(MonitoringTree::new());
        let mut state = state(ServerRole::Passive, Some(tree.clone()));
        state.start_up(false).unwrap();
        assert_eq!(
            tree.children(PLATFORM_PATH),
            vec![
                CLIENTS_ROOT_NAME.to_string(),
                ENTITIES_ROOT_NAME.to_string(),
                FETCHED_ROOT_NAME.to_string(),
                STATE_NODE_NAME.to_string()
            ]
        );
        assert_eq!(tree.server_state().as_deref(), Some(SERVER_STATE_STOPPED));
    }

    #[test]
    fn test_failed_reload_check_leaves_state_untouched() {
        let store = Arc::new(MemoryEntityStore::new());
        store
            .put(
                4,
                EntityData {
                    type_name: "Missing".to_string(),
                    version: 1,
                    name: "x".to_string(),
                    configuration: Vec::new(),
                },
            )
            .unwrap();
        let tree = Arc::new(MonitoringTree::new());
        let mut state = ProcessState::new(
            "unit".to_string(),
            ServerRole::Active,
            Some(store),
            Some(tree.clone() as Arc<dyn MonitoringProducer>),
        );

        assert!(state.start_up(true).is_err());
        assert!(!state.platform_registry_allocated());
        assert_eq!(state.snapshot().next_consumer_id, PLATFORM_CONSUMER_ID);
        assert!(tree.events().is_empty());
    }

    #[test]
    fn test_unknown_type_has_no_expected_version() {
        let state = state(ServerRole::Active, None);
        let err = state
            .service_for_version(&EntityTuple::new("Missing", "x"), 1)
            .err()
            .unwrap();
        assert!(matches!(err, EntityError::VersionMismatch { expected: None, .. }));
    }

    #[test]
    fn test_fetch_identifier_concatenates() {
        assert_eq!(fetch_identifier("7", "Cacheorders"), "7Cacheorders");
    }
}
