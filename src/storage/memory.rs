//! In-memory node store

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{AtlasError, Result};

use super::{NodeId, NodeStore};

/// Node store for in-memory databases and tests
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemoryNodeStore {
    fn allocate(&self) -> Result<NodeId> {
        Ok(NodeId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn write(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        self.nodes.write().insert(id, bytes.to_vec());
        Ok(())
    }

    fn read(&self, id: NodeId) -> Result<Vec<u8>> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| AtlasError::Persistence(format!("Node {} not found", id)))
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.nodes.write().remove(&id);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}
