//! Hot set of resident leaves and the cursor pin table

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AtlasError, Result};
use crate::storage::NodeId;

use super::node::LeafNode;

/// A leaf held in memory
pub(crate) struct CachedLeaf<K, V> {
    pub node: LeafNode<K, V>,
    pub dirty: bool,
    pub last_access: u64,
}

/// Arena of resident leaves keyed by node id
///
/// `entries` tracks the number of resident entries incrementally; callers
/// that move entries between leaves adjust it explicitly.
pub(crate) struct NodeCache<K, V> {
    leaves: HashMap<NodeId, CachedLeaf<K, V>>,
    clock: u64,
    entries: usize,
}

impl<K, V> NodeCache<K, V> {
    pub fn new() -> Self {
        Self {
            leaves: HashMap::new(),
            clock: 0,
            entries: 0,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.leaves.contains_key(&id)
    }

    /// Bump the access clock of a resident leaf
    pub fn touch(&mut self, id: NodeId) {
        self.clock += 1;
        let now = self.clock;
        if let Some(leaf) = self.leaves.get_mut(&id) {
            leaf.last_access = now;
        }
    }

    /// Add a leaf to the hot set
    pub fn install(&mut self, id: NodeId, node: LeafNode<K, V>, dirty: bool) {
        self.clock += 1;
        self.entries += node.entries.len();
        let previous = self.leaves.insert(
            id,
            CachedLeaf {
                node,
                dirty,
                last_access: self.clock,
            },
        );
        if let Some(previous) = previous {
            self.entries -= previous.node.entries.len();
        }
    }

    /// Drop a leaf from the hot set without flushing it
    pub fn discard(&mut self, id: NodeId) -> Option<CachedLeaf<K, V>> {
        let removed = self.leaves.remove(&id);
        if let Some(leaf) = &removed {
            self.entries -= leaf.node.entries.len();
        }
        removed
    }

    pub fn get(&self, id: NodeId) -> Result<&CachedLeaf<K, V>> {
        self.leaves
            .get(&id)
            .ok_or_else(|| AtlasError::Persistence(format!("{} is not resident", id)))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut CachedLeaf<K, V>> {
        self.leaves
            .get_mut(&id)
            .ok_or_else(|| AtlasError::Persistence(format!("{} is not resident", id)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut CachedLeaf<K, V>)> {
        self.leaves.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &CachedLeaf<K, V>)> {
        self.leaves.iter()
    }

    pub fn entry_added(&mut self) {
        self.entries += 1;
    }

    pub fn entry_removed(&mut self) {
        self.entries -= 1;
    }

    /// Entries moved out of a resident leaf into a leaf about to be installed
    pub fn entries_moved(&mut self, count: usize) {
        self.entries -= count;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.leaves.values().filter(|l| l.dirty).count()
    }

    pub fn clear(&mut self) {
        self.leaves.clear();
        self.entries = 0;
    }
}

/// Pin counts shared between a tree and its live cursors
#[derive(Clone, Default)]
pub(crate) struct PinTable {
    pins: Arc<Mutex<HashMap<NodeId, usize>>>,
}

impl PinTable {
    pub fn pin(&self, id: NodeId) {
        *self.pins.lock().entry(id).or_insert(0) += 1;
    }

    pub fn unpin(&self, id: NodeId) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&id);
            }
        }
    }

    pub fn is_pinned(&self, id: NodeId) -> bool {
        self.pins.lock().contains_key(&id)
    }

    pub fn pinned(&self) -> Vec<NodeId> {
        self.pins.lock().keys().copied().collect()
    }
}
