//! Record store interface
//!
//! The index layer only needs a narrow view of record storage: point loads,
//! saves and deletes, container scans for rebuilds, and an intent hint that
//! lets the store relax per-record overhead during bulk loads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{AtlasError, Result};

use super::{Record, RecordId};

/// Workload hint declared to the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Many inserts in a row (index rebuilds)
    MassiveInsert,
    /// Many reads in a row
    MassiveRead,
}

/// Storage of records, consumed by the index engine and the transaction layer
pub trait RecordStore: Send + Sync {
    /// Load a record by identity
    fn load(&self, id: RecordId) -> Result<Option<Record>>;

    /// Persist a record, returning its (possibly newly assigned) identity
    ///
    /// `container_hint` overrides the record's own container when given.
    fn save(&self, record: &Record, container_hint: Option<&str>) -> Result<RecordId>;

    /// Delete a record; returns whether it existed
    fn delete(&self, id: RecordId) -> Result<bool>;

    /// All records of a container, in position order
    fn browse_container(&self, name: &str) -> Result<Box<dyn Iterator<Item = Result<Record>> + '_>>;

    /// Number of records in a container
    fn count_elements(&self, name: &str) -> Result<u64>;

    /// Declare (or clear with `None`) a workload intent
    fn declare_intent(&self, intent: Option<Intent>);

    /// Cluster id of a container, creating the container if needed
    fn container_id(&self, name: &str) -> Result<u32>;
}

/// A single container of the in-memory store
struct Container {
    name: String,
    records: BTreeMap<i64, Record>,
    next_position: AtomicU64,
}

/// Record store keeping every record in memory
///
/// ## Concurrency:
/// - `containers`: Protected by RwLock (many concurrent readers, exclusive writer)
/// - `names`: container name -> cluster id, protected by RwLock
pub struct MemoryRecordStore {
    containers: RwLock<BTreeMap<u32, Container>>,
    names: RwLock<HashMap<String, u32>>,
    intent: RwLock<Option<Intent>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            names: RwLock::new(HashMap::new()),
            intent: RwLock::new(None),
        }
    }

    /// The currently declared intent (for testing/debugging)
    pub fn current_intent(&self) -> Option<Intent> {
        *self.intent.read()
    }

    /// Name of the container with the given cluster id
    pub fn container_name(&self, cluster: u32) -> Option<String> {
        self.containers.read().get(&cluster).map(|c| c.name.clone())
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.names.read().get(&name.to_lowercase()).copied()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, id: RecordId) -> Result<Option<Record>> {
        let containers = self.containers.read();
        Ok(containers
            .get(&id.cluster)
            .and_then(|c| c.records.get(&id.position))
            .cloned())
    }

    fn save(&self, record: &Record, container_hint: Option<&str>) -> Result<RecordId> {
        let container_name = container_hint.unwrap_or(&record.container);
        let cluster = self.container_id(container_name)?;

        let mut containers = self.containers.write();
        let container = containers
            .get_mut(&cluster)
            .ok_or_else(|| AtlasError::Persistence(format!("Container {} vanished", cluster)))?;

        // Persistent identities are kept; new and temporary ones get a fresh position
        let id = match record.id {
            Some(id) if !id.is_temporary() && id.cluster == cluster => id,
            _ => {
                let position = container.next_position.fetch_add(1, Ordering::SeqCst) as i64;
                RecordId::new(cluster, position)
            }
        };

        let mut stored = record.clone();
        stored.id = Some(id);
        stored.container = container.name.clone();
        container.records.insert(id.position, stored);

        Ok(id)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        let mut containers = self.containers.write();
        Ok(containers
            .get_mut(&id.cluster)
            .map(|c| c.records.remove(&id.position).is_some())
            .unwrap_or(false))
    }

    fn browse_container(&self, name: &str) -> Result<Box<dyn Iterator<Item = Result<Record>> + '_>> {
        // Snapshot under the read lock so the iterator holds no guard
        let records: Vec<Record> = match self.lookup(name) {
            Some(cluster) => self
                .containers
                .read()
                .get(&cluster)
                .map(|c| c.records.values().cloned().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn count_elements(&self, name: &str) -> Result<u64> {
        Ok(match self.lookup(name) {
            Some(cluster) => self
                .containers
                .read()
                .get(&cluster)
                .map(|c| c.records.len() as u64)
                .unwrap_or(0),
            None => 0,
        })
    }

    fn declare_intent(&self, intent: Option<Intent>) {
        *self.intent.write() = intent;
    }

    fn container_id(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.lookup(name) {
            return Ok(id);
        }

        let mut names = self.names.write();
        let key = name.to_lowercase();
        if let Some(&id) = names.get(&key) {
            return Ok(id);
        }

        let mut containers = self.containers.write();
        let id = containers.keys().next_back().map(|&id| id + 1).unwrap_or(1);
        containers.insert(
            id,
            Container {
                name: name.to_string(),
                records: BTreeMap::new(),
                next_position: AtomicU64::new(0),
            },
        );
        names.insert(key, id);

        tracing::debug!("Created container '{}' with cluster id {}", name, id);
        Ok(id)
    }
}
