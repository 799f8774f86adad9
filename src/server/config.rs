use crate::core::ServerRole;
use crate::monitoring::MonitoringProducer;
use crate::storage::EntityStore;
use std::fmt;
use std::sync::Arc;

/// Server process configuration
///
/// Built the same way as a connection config: start from a role, then chain
/// the optional collaborators.
#[derive(Clone)]
pub struct ServerConfig {
    /// Process name, used for the worker thread and in logs
    pub name: String,

    /// Whether the process hosts active or passive entities
    pub role: ServerRole,

    /// Reload entities recorded by the persistence adapter on start
    pub load_storage: bool,

    /// Persistence adapter recording entity existence and configuration
    pub persistence: Option<Arc<dyn EntityStore>>,

    /// Sink receiving the platform monitoring tree
    pub monitoring: Option<Arc<dyn MonitoringProducer>>,
}

impl ServerConfig {
    pub fn new(name: &str, role: ServerRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            load_storage: false,
            persistence: None,
            monitoring: None,
        }
    }

    pub fn active(name: &str) -> Self {
        Self::new(name, ServerRole::Active)
    }

    pub fn passive(name: &str) -> Self {
        Self::new(name, ServerRole::Passive)
    }

    /// Reload persisted entities on start
    pub fn load_storage(mut self, load: bool) -> Self {
        self.load_storage = load;
        self
    }

    pub fn persistence(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn monitoring(mut self, sink: Arc<dyn MonitoringProducer>) -> Self {
        self.monitoring = Some(sink);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Server name cannot be empty".to_string());
        }

        if self.load_storage && self.persistence.is_none() {
            return Err("load_storage requires a persistence adapter".to_string());
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::active("passthrough")
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("load_storage", &self.load_storage)
            .field("persistence", &self.persistence.is_some())
            .field("monitoring", &self.monitoring.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MonitoringTree;
    use crate::storage::MemoryEntityStore;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.name, "passthrough");
        assert_eq!(config.role, ServerRole::Active);
        assert!(!config.load_storage);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::passive("standby")
            .persistence(Arc::new(MemoryEntityStore::new()))
            .monitoring(Arc::new(MonitoringTree::new()))
            .load_storage(true);

        assert_eq!(config.role, ServerRole::Passive);
        assert!(config.persistence.is_some());
        assert!(config.monitoring.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::active("   ").validate().is_err());

        let reload_without_store = ServerConfig::active("node").load_storage(true);
        assert!(reload_without_store.validate().is_err());
    }

    #[test]
    fn test_debug_hides_collaborators() {
        let config = ServerConfig::active("node").persistence(Arc::new(MemoryEntityStore::new()));
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("persistence: true"));
        assert!(rendered.contains("monitoring: false"));
    }
}
