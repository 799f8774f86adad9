// ============================================================================
// Platform Monitoring
// ============================================================================
//
// The server publishes its state as a tree of named nodes:
//
//   platform/
//     clients/   one node per connected client origin
//     entities/  one node per live entity
//     fetched/   one node per (client, entity) fetch
//     state      ACTIVE / PASSIVE / STOPPED
//
// Publishing is observational only; nothing flows back into the server.
//
// ============================================================================

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const PLATFORM_ROOT_NAME: &str = "platform";
pub const CLIENTS_ROOT_NAME: &str = "clients";
pub const ENTITIES_ROOT_NAME: &str = "entities";
pub const FETCHED_ROOT_NAME: &str = "fetched";
pub const STATE_NODE_NAME: &str = "state";

pub const PLATFORM_PATH: &[&str] = &[PLATFORM_ROOT_NAME];
pub const CLIENTS_PATH: &[&str] = &[PLATFORM_ROOT_NAME, CLIENTS_ROOT_NAME];
pub const ENTITIES_PATH: &[&str] = &[PLATFORM_ROOT_NAME, ENTITIES_ROOT_NAME];
pub const FETCHED_PATH: &[&str] = &[PLATFORM_ROOT_NAME, FETCHED_ROOT_NAME];

pub const SERVER_STATE_STOPPED: &str = "STOPPED";
pub const SERVER_STATE_ACTIVE: &str = "ACTIVE";
pub const SERVER_STATE_PASSIVE: &str = "PASSIVE";

/// Value attached to a published node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PlatformNode {
    ServerState(String),
    ConnectedClient {
        client_id: u64,
    },
    Entity {
        type_name: String,
        name: String,
        is_active: bool,
    },
    FetchedEntity {
        client_identifier: String,
        entity_identifier: String,
    },
}

/// Sink for the platform's monitoring tree.
pub trait MonitoringProducer: Send + Sync {
    /// Adds (or replaces) `name` under `parents`. Returns false when the
    /// parent path does not exist.
    fn add_node(&self, parents: &[&str], name: &str, value: Option<PlatformNode>) -> bool;

    /// Removes `name` and everything below it. Returns false when absent.
    fn remove_node(&self, parents: &[&str], name: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MonitoringEvent {
    Added {
        path: Vec<String>,
        value: Option<PlatformNode>,
    },
    Removed {
        path: Vec<String>,
    },
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<Vec<String>, Option<PlatformNode>>,
    events: Vec<MonitoringEvent>,
}

/// In-memory [`MonitoringProducer`] keeping the tree and the ordered log of
/// every change applied to it.
#[derive(Default)]
pub struct MonitoringTree {
    state: Mutex<TreeState>,
}

fn node_path(parents: &[&str], name: &str) -> Vec<String> {
    parents
        .iter()
        .map(|part| part.to_string())
        .chain(std::iter::once(name.to_string()))
        .collect()
}

impl MonitoringTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &[&str]) -> bool {
        let key: Vec<String> = path.iter().map(|part| part.to_string()).collect();
        self.state
            .lock()
            .map(|state| state.nodes.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn value(&self, path: &[&str]) -> Option<PlatformNode> {
        let key: Vec<String> = path.iter().map(|part| part.to_string()).collect();
        self.state
            .lock()
            .ok()
            .and_then(|state| state.nodes.get(&key).cloned().flatten())
    }

    /// Names of the direct children of `parents`, sorted.
    pub fn children(&self, parents: &[&str]) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state
            .nodes
            .keys()
            .filter(|key| {
                key.len() == parents.len() + 1
                    && key.iter().zip(parents.iter()).all(|(a, b)| a == b)
            })
            .filter_map(|key| key.last().cloned())
            .collect()
    }

    pub fn server_state(&self) -> Option<String> {
        match self.value(&[PLATFORM_ROOT_NAME, STATE_NODE_NAME]) {
            Some(PlatformNode::ServerState(state)) => Some(state),
            _ => None,
        }
    }

    pub fn events(&self) -> Vec<MonitoringEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    /// Dumps the current tree as JSON. Each node is an object with an
    /// optional `"value"` and an optional `"children"` object.
    pub fn to_json(&self) -> serde_json::Value {
        match self.state.lock() {
            Ok(state) => subtree_json(&state.nodes, &[]),
            Err(_) => serde_json::Value::Null,
        }
    }
}

fn subtree_json(
    nodes: &BTreeMap<Vec<String>, Option<PlatformNode>>,
    prefix: &[String],
) -> serde_json::Value {
    let mut children = serde_json::Map::new();
    for (path, value) in nodes
        .iter()
        .filter(|(path, _)| path.len() == prefix.len() + 1 && path.starts_with(prefix))
    {
        let mut node = serde_json::Map::new();
        if let Some(value) = value {
            node.insert(
                "value".to_string(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        let below = subtree_json(nodes, path);
        if below.as_object().is_some_and(|map| !map.is_empty()) {
            node.insert("children".to_string(), below);
        }
        let name = path.last().cloned().unwrap_or_default();
        children.insert(name, serde_json::Value::Object(node));
    }
    serde_json::Value::Object(children)
}

impl MonitoringProducer for MonitoringTree {
    fn add_node(&self, parents: &[&str], name: &str, value: Option<PlatformNode>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let parent_key: Vec<String> = parents.iter().map(|part| part.to_string()).collect();
        if !parent_key.is_empty() && !state.nodes.contains_key(&parent_key) {
            return false;
        }
        let path = node_path(parents, name);
        state.nodes.insert(path.clone(), value.clone());
        state.events.push(MonitoringEvent::Added { path, value });
        true
    }

    fn remove_node(&self, parents: &[&str], name: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let path = node_path(parents, name);
        if state.nodes.remove(&path).is_none() {
            return false;
        }
        state.nodes.retain(|key, _| !key.starts_with(&path));
        state.events.push(MonitoringEvent::Removed { path });
        true
    }
}
