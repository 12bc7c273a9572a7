//! Index Manager
//!
//! Case-insensitive registry of the indexes of a database.
//!
//! ## Responsibilities
//! - Create and drop indexes, each with its own node store
//! - Persist every index's configuration snapshot to `indexes.json`
//! - Reload the registry on startup
//! - Find the automatic indexes watching a container

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::memory::MemoryMonitor;
use crate::record::RecordStore;
use crate::storage::{FileNodeStore, MemoryNodeStore, NodeStore};

use super::{Index, IndexDefinition, IndexSettings, IndexSnapshot, LoggingProgressListener, ValueExtractor};

/// On-disk registry document: `{"indexes": [snapshot, ...]}`
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    indexes: Vec<IndexSnapshot>,
}

/// Registry of indexes
///
/// ## Concurrency:
/// - `indexes`: lowercase name -> index, protected by RwLock
/// - Indexes are shared as `Arc<Index>`; each carries its own lock
pub struct IndexManager {
    config: Config,
    monitor: MemoryMonitor,
    indexes: RwLock<BTreeMap<String, Arc<Index>>>,
}

impl IndexManager {
    /// Open the registry, reloading every persisted index
    pub fn open(config: Config, monitor: MemoryMonitor) -> Result<Self> {
        let manager = Self {
            config,
            monitor,
            indexes: RwLock::new(BTreeMap::new()),
        };

        if manager.config.in_memory {
            return Ok(manager);
        }

        let path = manager.config.index_manager_path();
        if !path.exists() {
            return Ok(manager);
        }

        let document: RegistryDocument = serde_json::from_slice(&fs::read(&path)?)?;
        let settings = IndexSettings::from_config(&manager.config);
        {
            let mut indexes = manager.indexes.write();
            for snapshot in &document.indexes {
                let store = manager.node_store(&snapshot.name)?;
                let index = Index::load_from_configuration(snapshot, store, settings, Some(&manager.monitor), None)?;
                indexes.insert(snapshot.name.to_lowercase(), Arc::new(index));
            }
        }

        tracing::info!("Loaded {} indexes from {:?}", document.indexes.len(), path);
        Ok(manager)
    }

    /// Create an index and build it from the watched containers
    pub fn create_index(&self, definition: IndexDefinition, records: &dyn RecordStore) -> Result<Arc<Index>> {
        self.create_index_with_extractor(definition, None, records)
    }

    /// Create an index with a custom key extractor
    ///
    /// Custom extractors are not persisted: after a reopen the index only
    /// keeps its field extractor, if it has a field.
    pub fn create_index_with_extractor(
        &self,
        definition: IndexDefinition,
        extractor: Option<Arc<dyn ValueExtractor>>,
        records: &dyn RecordStore,
    ) -> Result<Arc<Index>> {
        validate_name(&definition.name)?;
        let key = definition.name.to_lowercase();
        let index = {
            let mut indexes = self.indexes.write();
            if indexes.contains_key(&key) {
                return Err(AtlasError::IndexExists(definition.name.clone()));
            }

            let store = self.node_store(&definition.name)?;
            let settings = IndexSettings::from_config(&self.config);
            let index = Arc::new(Index::create(definition, store, settings, Some(&self.monitor), extractor)?);
            indexes.insert(key.clone(), Arc::clone(&index));
            index
        };

        let built = self.save_configuration().and_then(|_| {
            let mut progress = LoggingProgressListener::new(index.name());
            index.rebuild(records, Some(&mut progress))
        });
        if let Err(e) = built {
            tracing::warn!("Creation of index '{}' failed: {}", index.name(), e);
            self.indexes.write().remove(&key);
            if let Err(cleanup) = self.destroy(&index) {
                tracing::error!("Cannot clean up index '{}': {}", index.name(), cleanup);
            }
            self.save_configuration()?;
            return Err(e);
        }

        Ok(index)
    }

    /// Drop an index and delete its storage
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let index = self
            .indexes
            .write()
            .remove(&name.to_lowercase())
            .ok_or_else(|| AtlasError::IndexNotFound(name.to_string()))?;

        self.destroy(&index)?;
        self.save_configuration()?;
        tracing::info!("Dropped index '{}'", index.name());
        Ok(())
    }

    /// Look up an index by name (case-insensitive)
    pub fn get(&self, name: &str) -> Result<Arc<Index>> {
        self.find(name).ok_or_else(|| AtlasError::IndexNotFound(name.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(&name.to_lowercase()).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.indexes.read().contains_key(&name.to_lowercase())
    }

    /// All indexes, ordered by lowercase name
    pub fn indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }

    /// Automatic indexes watching `container`
    pub fn automatic_indexes_for(&self, container: &str) -> Vec<Arc<Index>> {
        self.indexes
            .read()
            .values()
            .filter(|index| index.is_automatic() && index.watches(container))
            .cloned()
            .collect()
    }

    /// Add a watched container to an index and persist the change
    pub fn add_container(&self, name: &str, container: &str) -> Result<bool> {
        let added = self.get(name)?.add_container(container)?;
        if added {
            self.save_configuration()?;
        }
        Ok(added)
    }

    /// Remove a watched container from an index and persist the change
    pub fn remove_container(&self, name: &str, container: &str) -> Result<bool> {
        let removed = self.get(name)?.remove_container(container)?;
        if removed {
            self.save_configuration()?;
        }
        Ok(removed)
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Persist the registry document
    pub fn save_configuration(&self) -> Result<()> {
        if self.config.in_memory {
            return Ok(());
        }

        let document = RegistryDocument {
            indexes: self.indexes.read().values().map(|index| index.snapshot()).collect(),
        };

        let path = self.config.index_manager_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Close every index and persist the registry
    pub fn close(&self) -> Result<()> {
        self.save_configuration()?;

        let mut first_error = None;
        for index in self.indexes() {
            if let Err(e) = index.close() {
                tracing::error!("Cannot close index '{}': {}", index.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn node_store(&self, name: &str) -> Result<Arc<dyn NodeStore>> {
        if self.config.in_memory {
            return Ok(Arc::new(MemoryNodeStore::new()));
        }
        Ok(Arc::new(FileNodeStore::open(
            &self.config.index_dir(name),
            self.config.sync_writes,
        )?))
    }

    fn destroy(&self, index: &Index) -> Result<()> {
        index.delete()?;
        if !self.config.in_memory {
            remove_dir(&self.config.index_dir(index.name()))?;
        }
        Ok(())
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

/// Index names double as directory names under `indexes/`
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name.contains("..") || name.contains(['/', '\\', '\0']) {
        return Err(AtlasError::Config(format!("Invalid index name: {:?}", name)));
    }
    Ok(())
}
