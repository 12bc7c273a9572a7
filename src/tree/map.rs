//! Persistent Tree Map
//!
//! Ordered map whose leaves are loaded from and flushed to a `NodeStore`.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AtlasError, Result};
use crate::storage::{NodeId, NodeStore};

use super::cache::{NodeCache, PinTable};
use super::cursor::Cursor;
use super::node::{self, LeafNode, LeafRef, RootNode};
use super::{TreeKey, TreeSettings, TreeValue};

/// Ordered map with partial memory residency
///
/// ## Concurrency Model
///
/// - **Reads** (`get`, `range`, cursor steps) take `&self`. Loading a leaf
///   only touches the hot set, which sits behind an inner `Mutex`, so many
///   readers may share the map under an outer read lock.
/// - **Writes** (`put`, `remove`, `clear`, `optimize`, flushes) take
///   `&mut self` and therefore need the owner's exclusive lock.
///
/// ## Durability
///
/// Mutations only touch resident leaves. `lazy_save` writes dirty leaves,
/// then the root, then frees leaves the root no longer references, so the
/// persisted root never points at a deleted node.
///
/// Values owning nested storage follow the same rule. A value detached
/// from the tree is `retire`d and released only after the next flush; a
/// value whose storage is newer than the last flush is `stage`d and
/// released by `unload`, since the persisted tree never referenced it.
///
/// `hold_writes` suspends automatic saves and optimization flushes until
/// `commit_changes` or `unload`, so a batch is never persisted halfway.
pub struct PersistentTreeMap<K, V> {
    /// Backing container of all nodes of this tree
    store: Arc<dyn NodeStore>,

    /// Location of the root node
    root_id: NodeId,

    /// Root node (always resident, source of truth for size)
    root: RootNode<K>,
    root_dirty: bool,

    /// Resident leaves
    cache: Mutex<NodeCache<K, V>>,

    /// Leaves pinned by live cursors
    pins: PinTable,

    settings: TreeSettings,

    /// Leaves unlinked from the root, deleted on the next flush
    pending_frees: Vec<NodeId>,

    /// Values unlinked from the tree, released after the next flush
    retired: Vec<V>,

    /// Values whose nested storage the persisted tree does not reference yet
    staged: HashMap<NodeId, V>,

    /// Automatic flushes suspended until `commit_changes` or `unload`
    held: bool,

    updates_since_save: usize,
}

impl<K: TreeKey, V: TreeValue> PersistentTreeMap<K, V> {
    /// Create an empty tree in `store`
    ///
    /// The root is written immediately so the returned `root_id` always
    /// refers to an existing node.
    pub fn create(store: Arc<dyn NodeStore>, settings: TreeSettings) -> Result<Self> {
        let root_id = store.allocate()?;
        let root = RootNode::empty();
        store.write(root_id, &node::encode_root::<K, V>(&root)?)?;

        Ok(Self::with_root(store, root_id, root, settings))
    }

    /// Open an existing tree by its root location
    pub fn open(store: Arc<dyn NodeStore>, root_id: NodeId, settings: TreeSettings) -> Result<Self> {
        let root = Self::read_root(&*store, root_id)?;
        Ok(Self::with_root(store, root_id, root, settings))
    }

    fn with_root(store: Arc<dyn NodeStore>, root_id: NodeId, root: RootNode<K>, settings: TreeSettings) -> Self {
        Self {
            store,
            root_id,
            root,
            root_dirty: false,
            cache: Mutex::new(NodeCache::new()),
            pins: PinTable::default(),
            settings: TreeSettings {
                page_size: settings.page_size.max(2),
                ..settings
            },
            pending_frees: Vec::new(),
            retired: Vec::new(),
            staged: HashMap::new(),
            held: false,
            updates_since_save: 0,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value by key; a missing key is `Ok(None)`
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let Some(idx) = self.root.locate(key) else {
            return Ok(None);
        };
        let id = self.root.leaves[idx].id;

        let mut cache = self.cache.lock();
        Self::ensure_loaded(&*self.store, &mut cache, id)?;

        let leaf = cache.get(id)?;
        Ok(match leaf.node.search(key) {
            Ok(pos) => Some(leaf.node.entries[pos].1.clone()),
            Err(_) => None,
        })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Ordered entries between two bounds
    ///
    /// Both bounds must be mutually comparable. A `from` above `to` yields
    /// an empty result.
    pub fn range(&self, from: &K, to: &K, inclusive_from: bool, inclusive_to: bool) -> Result<Vec<(K, V)>> {
        if !from.comparable_with(to) {
            return Err(AtlasError::InvalidRange(format!(
                "Range from-to parameters are of different types: {:?} and {:?}",
                from, to
            )));
        }
        if from > to {
            return Ok(Vec::new());
        }

        let lower = if inclusive_from {
            Bound::Included(from.clone())
        } else {
            Bound::Excluded(from.clone())
        };
        let upper = if inclusive_to {
            Bound::Included(to.clone())
        } else {
            Bound::Excluded(to.clone())
        };

        self.collect(self.cursor(lower, upper))
    }

    /// All entries in key order
    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.collect(self.cursor(Bound::Unbounded, Bound::Unbounded))
    }

    /// A lazily advancing cursor over `[lower, upper]`
    ///
    /// Every leaf the cursor visits stays pinned until the cursor is
    /// exhausted, closed or dropped.
    pub fn cursor(&self, lower: Bound<K>, upper: Bound<K>) -> Cursor<K, V> {
        Cursor::new(lower, upper, self.pins.clone())
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        Ok(self.root.leaves.first().map(|l| l.low.clone()))
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let Some(last) = self.root.leaves.last() else {
            return Ok(None);
        };

        let mut cache = self.cache.lock();
        Self::ensure_loaded(&*self.store, &mut cache, last.id)?;
        Ok(cache.get(last.id)?.node.entries.last().map(|(k, _)| k.clone()))
    }

    /// Number of entries (authoritative, independent of residency)
    pub fn size(&self) -> u64 {
        self.root.size
    }

    pub fn is_empty(&self) -> bool {
        self.root.size == 0
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or replace an entry, returning the previous value
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        let previous = if self.root.leaves.is_empty() {
            let id = self.store.allocate()?;
            self.cache.get_mut().install(
                id,
                LeafNode {
                    entries: vec![(key.clone(), value)],
                },
                true,
            );
            self.root.leaves.push(LeafRef { low: key, id, len: 1 });
            None
        } else {
            let idx = self.root.locate(&key).unwrap_or(0);
            let id = self.root.leaves[idx].id;

            let cache = self.cache.get_mut();
            Self::ensure_loaded(&*self.store, cache, id)?;
            let leaf = cache.get_mut(id)?;
            leaf.dirty = true;

            let previous = match leaf.node.search(&key) {
                Ok(pos) => Some(std::mem::replace(&mut leaf.node.entries[pos].1, value)),
                Err(pos) => {
                    leaf.node.entries.insert(pos, (key, value));
                    None
                }
            };

            let len = leaf.node.entries.len();
            let low = leaf.node.entries[0].0.clone();
            if previous.is_none() {
                cache.entry_added();
                let leaf_ref = &mut self.root.leaves[idx];
                leaf_ref.len = len;
                leaf_ref.low = low;
            }

            if len > self.settings.page_size {
                self.split_leaf(idx)?;
            }
            previous
        };

        if previous.is_none() {
            self.root.size += 1;
            self.root_dirty = true;
        }

        self.after_update()?;
        Ok(previous)
    }

    /// Remove an entry, returning its value if it existed
    ///
    /// The removed value is handed back as is; releasing any storage it owns
    /// is up to the caller.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let Some(idx) = self.root.locate(key) else {
            return Ok(None);
        };
        let id = self.root.leaves[idx].id;

        let cache = self.cache.get_mut();
        Self::ensure_loaded(&*self.store, cache, id)?;
        let leaf = cache.get_mut(id)?;

        let pos = match leaf.node.search(key) {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };

        let (_, value) = leaf.node.entries.remove(pos);
        leaf.dirty = true;
        let remaining = leaf.node.entries.len();
        let low = leaf.node.entries.first().map(|(k, _)| k.clone());
        cache.entry_removed();

        match low {
            None => {
                cache.discard(id);
                self.root.leaves.remove(idx);
                self.pending_frees.push(id);
            }
            Some(low) => {
                let leaf_ref = &mut self.root.leaves[idx];
                leaf_ref.len = remaining;
                leaf_ref.low = low;
            }
        }

        self.root.size -= 1;
        self.root_dirty = true;

        self.after_update()?;
        Ok(Some(value))
    }

    /// Remove every entry; storage owned by the values is retired
    pub fn clear(&mut self) -> Result<()> {
        // Collect first: a read failure here leaves the tree untouched
        let mut owned = Vec::new();
        if V::NEEDS_RELEASE {
            for leaf_ref in &self.root.leaves {
                owned.extend(self.leaf_snapshot(leaf_ref.id)?.into_iter().map(|(_, value)| value));
            }
        }

        let cache = self.cache.get_mut();
        for leaf_ref in self.root.leaves.drain(..) {
            cache.discard(leaf_ref.id);
            self.pending_frees.push(leaf_ref.id);
        }

        self.root.size = 0;
        self.root_dirty = true;

        for value in owned {
            self.retire(value)?;
        }
        Ok(())
    }

    /// Clear the tree and delete every node it owns, root included
    pub fn delete(&mut self) -> Result<()> {
        self.clear()?;
        for id in self.pending_frees.drain(..) {
            self.store.delete(id)?;
        }
        for value in std::mem::take(&mut self.retired) {
            value.release(&self.store)?;
        }
        self.store.delete(self.root_id)?;
        self.cache.get_mut().clear();
        self.root_dirty = false;
        Ok(())
    }

    // =========================================================================
    // Owned Storage
    // =========================================================================

    /// Hand over a value removed from the tree for release
    ///
    /// Storage the persisted tree may still reference is released after the
    /// next flush; staged storage is released right away.
    pub fn retire(&mut self, value: V) -> Result<()> {
        let Some(root) = value.owned_root() else {
            return Ok(());
        };

        if self.staged.remove(&root).is_some() {
            value.release(&self.store)
        } else {
            self.retired.push(value);
            Ok(())
        }
    }

    /// Record a value whose nested storage was created since the last flush
    pub fn stage(&mut self, value: &V) {
        if let Some(root) = value.owned_root() {
            self.staged.insert(root, value.clone());
        }
    }

    /// Whether the nested storage rooted at `root` is staged
    pub fn is_staged(&self, root: NodeId) -> bool {
        self.staged.contains_key(&root)
    }

    /// Suspend automatic flushes until `commit_changes` or `unload`
    pub fn hold_writes(&mut self) {
        self.held = true;
    }

    pub fn holds_writes(&self) -> bool {
        self.held
    }

    // =========================================================================
    // Persistence & Residency
    // =========================================================================

    /// Flush dirty resident nodes; returns the number of nodes written
    pub fn lazy_save(&mut self) -> Result<usize> {
        self.flush_dirty()
    }

    /// Flush everything and make it durable; lifts `hold_writes`
    pub fn commit_changes(&mut self) -> Result<usize> {
        let written = self.flush_dirty()?;
        self.store.sync()?;
        self.held = false;
        Ok(written)
    }

    /// Eviction pass; returns the number of leaves evicted
    ///
    /// Every dirty node is flushed first; if any flush fails the pass stops
    /// before evicting anything. Soft mode evicts the least recently used
    /// half of the unpinned resident leaves, hard mode all of them. While
    /// writes are held nothing is flushed and only clean leaves are evicted.
    pub fn optimize(&mut self, hard: bool) -> Result<usize> {
        if !self.held {
            self.flush_dirty()?;
        }

        let cache = self.cache.get_mut();
        let mut candidates: Vec<(NodeId, u64)> = cache
            .iter()
            .filter(|(id, leaf)| !leaf.dirty && !self.pins.is_pinned(**id))
            .map(|(id, leaf)| (*id, leaf.last_access))
            .collect();

        if !hard {
            candidates.sort_by_key(|&(_, last_access)| last_access);
            candidates.truncate(candidates.len() / 2);
        }

        for (id, _) in &candidates {
            cache.discard(*id);
        }

        Ok(candidates.len())
    }

    /// Drop every resident leaf, discarding unsaved changes, and reload the
    /// root from the store
    ///
    /// Staged storage is released since nothing persisted refers to it.
    pub fn unload(&mut self) -> Result<()> {
        self.cache.get_mut().clear();
        self.pending_frees.clear();
        self.retired.clear();
        self.updates_since_save = 0;
        self.held = false;
        self.root = Self::read_root(&*self.store, self.root_id)?;
        self.root_dirty = false;

        let mut first_err = None;
        for (root, value) in self.staged.drain() {
            if let Err(e) = value.release(&self.store) {
                tracing::warn!("Cannot release staged storage {}: {}", root, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Accessors (for diagnostics and testing)
    // =========================================================================

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn settings(&self) -> TreeSettings {
        self.settings
    }

    /// Entries currently resident in memory
    pub fn in_memory_entries(&self) -> usize {
        self.cache.lock().entries()
    }

    /// Number of resident leaves
    pub fn resident_nodes(&self) -> usize {
        self.cache.lock().len()
    }

    /// Ids of the resident leaves
    pub fn resident_node_ids(&self) -> Vec<NodeId> {
        self.cache.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Ids of the leaves pinned by live cursors
    pub fn pinned_node_ids(&self) -> Vec<NodeId> {
        self.pins.pinned()
    }

    pub fn pinned_nodes(&self) -> usize {
        self.pins.pinned().len()
    }

    /// Number of resident leaves with unsaved changes
    pub fn dirty_nodes(&self) -> usize {
        self.cache.lock().dirty_count() + usize::from(self.root_dirty)
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> usize {
        self.root.leaves.len()
    }

    // =========================================================================
    // Crate-internal helpers for cursors
    // =========================================================================

    /// Leaf index to start scanning from for a lower bound
    pub(crate) fn seek(&self, lower: &Bound<K>) -> Option<usize> {
        match lower {
            Bound::Unbounded => (!self.root.leaves.is_empty()).then_some(0),
            Bound::Included(k) | Bound::Excluded(k) => self.root.locate(k),
        }
    }

    pub(crate) fn leaf_id(&self, idx: usize) -> Option<NodeId> {
        self.root.leaves.get(idx).map(|l| l.id)
    }

    /// Entries of one leaf inside the bounds, plus whether the leaf holds
    /// keys past the upper bound
    pub(crate) fn scan_leaf(&self, id: NodeId, lower: &Bound<K>, upper: &Bound<K>) -> Result<(Vec<(K, V)>, bool)> {
        let mut cache = self.cache.lock();
        Self::ensure_loaded(&*self.store, &mut cache, id)?;
        let entries = &cache.get(id)?.node.entries;

        let start = entries.partition_point(|(k, _)| match lower {
            Bound::Unbounded => false,
            Bound::Included(low) => k < low,
            Bound::Excluded(low) => k <= low,
        });

        let mut out = Vec::new();
        let mut passed_upper = false;
        for (k, v) in &entries[start..] {
            let within = match upper {
                Bound::Unbounded => true,
                Bound::Included(high) => k <= high,
                Bound::Excluded(high) => k < high,
            };
            if !within {
                passed_upper = true;
                break;
            }
            out.push((k.clone(), v.clone()));
        }

        Ok((out, passed_upper))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn collect(&self, mut cursor: Cursor<K, V>) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(entry) = cursor.next_entry(self)? {
            out.push(entry);
        }
        cursor.close();
        Ok(out)
    }

    fn read_root(store: &dyn NodeStore, root_id: NodeId) -> Result<RootNode<K>> {
        let bytes = store.read(root_id)?;
        node::decode_root::<K, V>(root_id, &bytes)
    }

    /// Make a leaf resident, loading it from the store if needed
    fn ensure_loaded(store: &dyn NodeStore, cache: &mut NodeCache<K, V>, id: NodeId) -> Result<()> {
        if cache.contains(id) {
            cache.touch(id);
            return Ok(());
        }

        let bytes = store.read(id)?;
        let leaf = node::decode_leaf::<K, V>(id, &bytes)?;
        cache.install(id, leaf, false);
        Ok(())
    }

    /// Entries of a leaf without making it resident
    fn leaf_snapshot(&self, id: NodeId) -> Result<Vec<(K, V)>> {
        let cache = self.cache.lock();
        if cache.contains(id) {
            return Ok(cache.get(id)?.node.entries.clone());
        }
        drop(cache);

        let bytes = self.store.read(id)?;
        Ok(node::decode_leaf::<K, V>(id, &bytes)?.entries)
    }

    /// Split an overflowing leaf in half
    fn split_leaf(&mut self, idx: usize) -> Result<()> {
        let id = self.root.leaves[idx].id;
        let new_id = self.store.allocate()?;

        let cache = self.cache.get_mut();
        let leaf = cache.get_mut(id)?;
        let mid = leaf.node.entries.len() / 2;
        let upper = leaf.node.entries.split_off(mid);
        leaf.dirty = true;
        let left_len = leaf.node.entries.len();

        let right_len = upper.len();
        let low = upper[0].0.clone();
        cache.entries_moved(right_len);
        cache.install(new_id, LeafNode { entries: upper }, true);

        self.root.leaves[idx].len = left_len;
        self.root.leaves.insert(
            idx + 1,
            LeafRef {
                low,
                id: new_id,
                len: right_len,
            },
        );
        self.root_dirty = true;

        tracing::trace!("Split {} at {} entries into {}", id, mid, new_id);
        Ok(())
    }

    fn flush_dirty(&mut self) -> Result<usize> {
        let mut written = 0;

        // Step 1: Leaves
        for (id, leaf) in self.cache.get_mut().iter_mut() {
            if leaf.dirty {
                self.store.write(*id, &node::encode_leaf(&leaf.node)?)?;
                leaf.dirty = false;
                written += 1;
            }
        }

        // Step 2: Root (references only leaves written above or earlier)
        if self.root_dirty {
            self.store.write(self.root_id, &node::encode_root::<K, V>(&self.root)?)?;
            self.root_dirty = false;
            written += 1;
        }

        // Staged storage is now referenced by the persisted tree
        self.staged.clear();

        // Step 3: Leaves the persisted root no longer references
        while let Some(id) = self.pending_frees.pop() {
            if let Err(e) = self.store.delete(id) {
                self.pending_frees.push(id);
                return Err(e);
            }
        }

        // Step 4: Storage of retired values
        while let Some(value) = self.retired.pop() {
            if let Err(e) = value.release(&self.store) {
                self.retired.push(value);
                return Err(e);
            }
        }

        self.updates_since_save = 0;
        Ok(written)
    }

    fn after_update(&mut self) -> Result<()> {
        self.updates_since_save += 1;
        if self.held {
            return Ok(());
        }

        if self.settings.max_updates_before_save > 0
            && self.updates_since_save >= self.settings.max_updates_before_save
        {
            self.flush_dirty()?;
        }

        if self.settings.optimize_threshold > 0 && self.in_memory_entries() > self.settings.optimize_threshold {
            let evicted = self.optimize(false)?;
            tracing::debug!(
                "Auto optimization evicted {} leaves, {} entries remain resident",
                evicted,
                self.in_memory_entries()
            );
        }

        Ok(())
    }
}
