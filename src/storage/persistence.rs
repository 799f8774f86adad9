//! Persistence of entity existence and configuration, keyed by consumer id.

use crate::core::{ConsumerId, Result, ServerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

// ============================================================================
// Entity Records
// ============================================================================

/// What the server needs to rebuild an entity after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityData {
    pub type_name: String,
    pub version: u64,
    pub name: String,
    pub configuration: Vec<u8>,
}

/// Ordered key-value store of [`EntityData`] by consumer id.
pub trait EntityStore: Send + Sync {
    /// Opens a store that already exists. Used when reloading.
    fn open(&self) -> Result<()>;

    /// Starts a fresh store, dropping anything previously recorded.
    fn create(&self) -> Result<()>;

    fn put(&self, consumer_id: ConsumerId, data: EntityData) -> Result<()>;

    fn get(&self, consumer_id: ConsumerId) -> Result<Option<EntityData>>;

    fn remove(&self, consumer_id: ConsumerId) -> Result<bool>;

    /// All records, ordered by consumer id.
    fn entries(&self) -> Result<Vec<(ConsumerId, EntityData)>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Store that lives as long as the `Arc` sharing it between process restarts.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entries: Mutex<BTreeMap<ConsumerId, EntityData>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryEntityStore {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn create(&self) -> Result<()> {
        self.entries.lock()?.clear();
        Ok(())
    }

    fn put(&self, consumer_id: ConsumerId, data: EntityData) -> Result<()> {
        self.entries.lock()?.insert(consumer_id, data);
        Ok(())
    }

    fn get(&self, consumer_id: ConsumerId) -> Result<Option<EntityData>> {
        Ok(self.entries.lock()?.get(&consumer_id).cloned())
    }

    fn remove(&self, consumer_id: ConsumerId) -> Result<bool> {
        Ok(self.entries.lock()?.remove(&consumer_id).is_some())
    }

    fn entries(&self) -> Result<Vec<(ConsumerId, EntityData)>> {
        Ok(self
            .entries
            .lock()?
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect())
    }
}

// ============================================================================
// File Store
// ============================================================================

/// Store kept as a single MessagePack file.
///
/// Every mutation rewrites the whole file through a temporary file in the same
/// directory, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileEntityStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<ConsumerId, EntityData>>,
}

impl FileEntityStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &BTreeMap<ConsumerId, EntityData>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| {
            ServerError::Storage(format!("Failed to create store directory: {}", e))
        })?;
        let serialized = rmp_serde::to_vec(entries)
            .map_err(|e| ServerError::Storage(format!("Failed to serialize entities: {}", e)))?;

        let temp = NamedTempFile::new_in(&dir)
            .map_err(|e| ServerError::Storage(format!("Failed to create temp file: {}", e)))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer
                .write_all(&serialized)
                .map_err(|e| ServerError::Storage(format!("Failed to write entities: {}", e)))?;
            writer
                .flush()
                .map_err(|e| ServerError::Storage(format!("Failed to flush entities: {}", e)))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| ServerError::Storage(format!("Failed to sync entities: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| ServerError::Storage(format!("Failed to rename entity store: {}", e)))?;
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<ConsumerId, EntityData>> {
        let mut file = File::open(&self.path).map_err(|e| {
            ServerError::Storage(format!(
                "Failed to open entity store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| ServerError::Storage(format!("Failed to read entity store: {}", e)))?;
        rmp_serde::from_slice(&data)
            .map_err(|e| ServerError::Storage(format!("Failed to deserialize entities: {}", e)))
    }
}

impl EntityStore for FileEntityStore {
    fn open(&self) -> Result<()> {
        let loaded = self.load()?;
        *self.entries.lock()? = loaded;
        Ok(())
    }

    fn create(&self) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.clear();
        self.save(&entries)
    }

    fn put(&self, consumer_id: ConsumerId, data: EntityData) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.insert(consumer_id, data);
        self.save(&entries)
    }

    fn get(&self, consumer_id: ConsumerId) -> Result<Option<EntityData>> {
        Ok(self.entries.lock()?.get(&consumer_id).cloned())
    }

    fn remove(&self, consumer_id: ConsumerId) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        if entries.remove(&consumer_id).is_none() {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    fn entries(&self) -> Result<Vec<(ConsumerId, EntityData)>> {
        Ok(self
            .entries
            .lock()?
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(name: &str) -> EntityData {
        EntityData {
            type_name: "Cache".to_string(),
            version: 1,
            name: name.to_string(),
            configuration: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_memory_store_create_clears_and_open_keeps() {
        let store = MemoryEntityStore::new();
        store.put(3, data("a")).unwrap();
        store.open().unwrap();
        assert_eq!(store.get(3).unwrap(), Some(data("a")));
        store.create().unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("entities.store");

        let store = FileEntityStore::new(&path);
        store.create().unwrap();
        store.put(5, data("b")).unwrap();
        store.put(2, data("a")).unwrap();
        store.put(9, data("c")).unwrap();
        assert!(store.remove(9).unwrap());
        assert!(!store.remove(9).unwrap());

        let reopened = FileEntityStore::new(&path);
        reopened.open().unwrap();
        let ids: Vec<_> = reopened.entries().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(reopened.get(5).unwrap(), Some(data("b")));
    }

    #[test]
    fn test_file_store_open_requires_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileEntityStore::new(temp_dir.path().join("missing.store"));
        assert!(matches!(store.open(), Err(ServerError::Storage(_))));
    }
}
