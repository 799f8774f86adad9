//! Shared fixtures for the integration suites: a small `Cache` entity whose
//! active and passive sides keep their entries in a per-process
//! `CacheStorage` service, and helpers to stand up server processes.

#![allow(dead_code)]

use passthrough_server::prelude::entity::*;
use passthrough_server::prelude::host::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const CACHE_TYPE: &str = "Cache";
pub const CACHE_VERSION: u64 = 1;

pub fn cache(name: &str) -> EntityTuple {
    EntityTuple::new(CACHE_TYPE, name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMessage {
    Put { key: String, value: String },
    Get { key: String },
    Remove { key: String },
    Describe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheResponse {
    Stored,
    Value(Option<String>),
    Removed(bool),
    Described { consumer_id: u64, label: String },
}

pub fn encode(message: &CacheMessage) -> Vec<u8> {
    SerdeCodec::<CacheMessage, CacheResponse>::new()
        .encode_message(message)
        .unwrap()
}

pub fn decode(payload: &[u8]) -> CacheResponse {
    SerdeCodec::<CacheMessage, CacheResponse>::new()
        .decode_response(payload)
        .unwrap()
}

pub fn put(key: &str, value: &str) -> Vec<u8> {
    encode(&CacheMessage::Put {
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub fn get(key: &str) -> Vec<u8> {
    encode(&CacheMessage::Get {
        key: key.to_string(),
    })
}

/// Partition a cache key falls into when synchronizing a passive.
pub fn bucket_of(key: &str) -> ConcurrencyKey {
    key.bytes().map(u32::from).sum::<u32>() % 4 + 1
}

// ============================================================================
// Hook log
// ============================================================================

/// Ordered record of every hook the entities of one process ran.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|event| event.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

// ============================================================================
// Storage service
// ============================================================================

/// Where cache entries of one process live, keyed by cache label.
#[derive(Default)]
pub struct CacheStorage {
    caches: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl CacheStorage {
    pub fn entries(&self, label: &str) -> BTreeMap<String, String> {
        self.caches
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.caches.lock().unwrap().contains_key(label)
    }

    fn reset(&self, label: &str) {
        self.caches
            .lock()
            .unwrap()
            .insert(label.to_string(), BTreeMap::new());
    }

    fn put(&self, label: &str, key: &str, value: &str) {
        self.caches
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, label: &str, key: &str) -> bool {
        self.caches
            .lock()
            .unwrap()
            .get_mut(label)
            .is_some_and(|entries| entries.remove(key).is_some())
    }

    fn drop_cache(&self, label: &str) {
        self.caches.lock().unwrap().remove(label);
    }
}

// ============================================================================
// Entity
// ============================================================================

pub struct CacheActive {
    label: String,
    entries: BTreeMap<String, String>,
    registry: ServiceRegistry,
    storage: Option<Arc<CacheStorage>>,
    events: EventLog,
    codec: SerdeCodec<CacheMessage, CacheResponse>,
}

impl CacheActive {
    fn record(&self, hook: &str) {
        self.events.record(format!("active:{}:{}", hook, self.label));
    }
}

impl CommonServerEntity for CacheActive {
    fn create_new(&mut self) {
        self.record("create_new");
        if let Some(storage) = &self.storage {
            storage.reset(&self.label);
        }
    }

    fn load_existing(&mut self) {
        self.record("load_existing");
        if let Some(storage) = &self.storage {
            self.entries = storage.entries(&self.label);
        }
    }

    fn destroy(&mut self) {
        self.record("destroy");
        if let Some(storage) = &self.storage {
            storage.drop_cache(&self.label);
        }
    }
}

impl ActiveServerEntity for CacheActive {
    type Message = CacheMessage;
    type Response = CacheResponse;

    fn message_codec(&self) -> &dyn MessageCodec<CacheMessage, CacheResponse> {
        &self.codec
    }

    fn connected(&mut self, client: &ClientDescriptor) {
        self.events.record(format!(
            "active:connected:{}:{}/{}",
            self.label, client.origin_id, client.instance_id
        ));
    }

    fn disconnected(&mut self, client: &ClientDescriptor) {
        self.events.record(format!(
            "active:disconnected:{}:{}/{}",
            self.label, client.origin_id, client.instance_id
        ));
    }

    fn config(&self) -> Vec<u8> {
        self.label.as_bytes().to_vec()
    }

    fn invoke(&mut self, client: &ClientDescriptor, message: CacheMessage) -> CacheResponse {
        self.events.record(format!(
            "active:invoke:{}:{}:{:?}",
            self.label, client.origin_id, message
        ));
        match message {
            CacheMessage::Put { key, value } => {
                if let Some(storage) = &self.storage {
                    storage.put(&self.label, &key, &value);
                }
                self.entries.insert(key, value);
                CacheResponse::Stored
            }
            CacheMessage::Get { key } => CacheResponse::Value(self.entries.get(&key).cloned()),
            CacheMessage::Remove { key } => {
                if let Some(storage) = &self.storage {
                    storage.remove(&self.label, &key);
                }
                CacheResponse::Removed(self.entries.remove(&key).is_some())
            }
            CacheMessage::Describe => CacheResponse::Described {
                consumer_id: self.registry.consumer_id(),
                label: self.label.clone(),
            },
        }
    }

    fn handle_reconnect(&mut self, client: &ClientDescriptor, extended_data: &[u8]) {
        self.events.record(format!(
            "active:reconnect:{}:{}/{}:{}",
            self.label,
            client.origin_id,
            client.instance_id,
            String::from_utf8_lossy(extended_data)
        ));
    }

    fn keys_for_synchronization(&self) -> Vec<ConcurrencyKey> {
        let buckets: BTreeSet<ConcurrencyKey> =
            self.entries.keys().map(|key| bucket_of(key)).collect();
        buckets.into_iter().collect()
    }

    fn synchronize_key_to_passive(
        &mut self,
        channel: &mut dyn PassiveSynchronizationChannel,
        key: ConcurrencyKey,
    ) {
        for (entry, value) in &self.entries {
            if bucket_of(entry) == key {
                channel.synchronize_to_passive(put(entry, value));
            }
        }
    }
}

pub struct CachePassive {
    label: String,
    storage: Option<Arc<CacheStorage>>,
    events: EventLog,
    codec: SerdeCodec<CacheMessage, CacheResponse>,
}

impl CachePassive {
    fn record(&self, hook: &str) {
        self.events.record(format!("passive:{}:{}", hook, self.label));
    }
}

impl CommonServerEntity for CachePassive {
    fn create_new(&mut self) {
        self.record("create_new");
        if let Some(storage) = &self.storage {
            storage.reset(&self.label);
        }
    }

    fn load_existing(&mut self) {
        self.record("load_existing");
    }

    fn destroy(&mut self) {
        self.record("destroy");
        if let Some(storage) = &self.storage {
            storage.drop_cache(&self.label);
        }
    }
}

impl PassiveServerEntity for CachePassive {
    type Message = CacheMessage;
    type Response = CacheResponse;

    fn message_codec(&self) -> &dyn MessageCodec<CacheMessage, CacheResponse> {
        &self.codec
    }

    fn invoke(&mut self, message: CacheMessage) {
        self.events
            .record(format!("passive:invoke:{}:{:?}", self.label, message));
        let Some(storage) = &self.storage else {
            return;
        };
        match message {
            CacheMessage::Put { key, value } => storage.put(&self.label, &key, &value),
            CacheMessage::Remove { key } => {
                storage.remove(&self.label, &key);
            }
            CacheMessage::Get { .. } | CacheMessage::Describe => {}
        }
    }

    fn start_sync_entity(&mut self) {
        self.record("start_sync_entity");
    }

    fn end_sync_entity(&mut self) {
        self.record("end_sync_entity");
    }

    fn start_sync_concurrency_key(&mut self, key: ConcurrencyKey) {
        self.events
            .record(format!("passive:start_sync_key:{}:{}", self.label, key));
    }

    fn end_sync_concurrency_key(&mut self, key: ConcurrencyKey) {
        self.events
            .record(format!("passive:end_sync_key:{}:{}", self.label, key));
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct CacheService {
    version: u64,
    events: EventLog,
}

impl CacheService {
    pub fn new(version: u64, events: EventLog) -> Self {
        Self { version, events }
    }
}

fn label_of(configuration: &[u8]) -> Result<String, EntityError> {
    String::from_utf8(configuration.to_vec())
        .map_err(|err| EntityError::Configuration(format!("cache label is not UTF-8: {}", err)))
}

impl ServerEntityService for CacheService {
    fn handles_entity_type(&self, type_name: &str) -> bool {
        type_name == CACHE_TYPE
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn create_active_entity(
        &self,
        registry: ServiceRegistry,
        configuration: &[u8],
    ) -> Result<BoxedActiveEntity, EntityError> {
        let storage = registry.get_service::<CacheStorage>();
        Ok(Box::new(CacheActive {
            label: label_of(configuration)?,
            entries: BTreeMap::new(),
            registry,
            storage,
            events: self.events.clone(),
            codec: SerdeCodec::new(),
        }))
    }

    fn create_passive_entity(
        &self,
        registry: ServiceRegistry,
        configuration: &[u8],
    ) -> Result<BoxedPassiveEntity, EntityError> {
        Ok(Box::new(CachePassive {
            label: label_of(configuration)?,
            storage: registry.get_service::<CacheStorage>(),
            events: self.events.clone(),
            codec: SerdeCodec::new(),
        }))
    }
}

// ============================================================================
// Process helpers
// ============================================================================

/// A server process plus the observers the tests read back.
pub struct Node {
    pub server: ServerProcess,
    pub events: EventLog,
    pub storage: Arc<CacheStorage>,
    pub monitoring: Arc<MonitoringTree>,
}

/// Builds a process hosting the `Cache` service at `version`, not started.
pub fn build_node_with_version(config: ServerConfig, version: u64) -> Node {
    let events = EventLog::default();
    let storage = Arc::new(CacheStorage::default());
    let monitoring = Arc::new(MonitoringTree::new());
    let mut server = ServerProcess::new(config.monitoring(monitoring.clone())).unwrap();
    server
        .register_entity_service(Arc::new(CacheService::new(version, events.clone())))
        .unwrap();
    server
        .register_service_provider(Arc::new(SharedServiceProvider::new(storage.clone())))
        .unwrap();
    Node {
        server,
        events,
        storage,
        monitoring,
    }
}

pub fn build_node(config: ServerConfig) -> Node {
    build_node_with_version(config, CACHE_VERSION)
}

pub fn start_node(config: ServerConfig) -> Node {
    let mut node = build_node(config);
    node.server.start().unwrap();
    node
}

pub fn active_node(name: &str) -> Node {
    start_node(ServerConfig::active(name))
}

pub fn passive_node(name: &str) -> Node {
    start_node(ServerConfig::passive(name))
}

/// Waits for a worker that is expected to die on its own.
pub fn wait_until_stopped(server: &ServerProcess) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.is_running() {
        assert!(Instant::now() < deadline, "worker of '{}' is still running", server.name());
        thread::sleep(Duration::from_millis(5));
    }
}
