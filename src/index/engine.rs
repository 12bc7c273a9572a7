//! Index Engine
//!
//! One ordered key -> identifier-set mapping and its lifecycle.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::memory::{MemoryMonitor, PressureLevel, PressureSubscription};
use crate::record::{Intent, Record, RecordId, RecordStore};
use crate::storage::NodeStore;
use crate::tree::{Cursor, PersistentTreeMap, RidSet, RidSetContext, TreeKey, TreeSettings, TreeValue, ValueEncoding};
use crate::tx::{CommitBatch, IndexOpStatus, OperationKey};

use super::{FieldExtractor, IndexDefinition, IndexKey, IndexKind, IndexSnapshot, ProgressListener, ValueExtractor};

/// Lifecycle state of an index
///
/// `Unloaded -> Loading -> Ready <-> Optimizing -> Ready -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexStatus {
    Unloaded = 0,
    Loading = 1,
    Ready = 2,
    Optimizing = 3,
    Closed = 4,
}

impl IndexStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => IndexStatus::Unloaded,
            1 => IndexStatus::Loading,
            2 => IndexStatus::Ready,
            3 => IndexStatus::Optimizing,
            _ => IndexStatus::Closed,
        }
    }
}

/// Tree tuning of an index and its external identifier sets
#[derive(Debug, Clone, Copy)]
pub struct IndexSettings {
    pub tree: TreeSettings,
    pub rid_tree: TreeSettings,
    pub rid_binary_threshold: usize,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tree: config.tree_settings(),
            rid_tree: config.rid_tree_settings(),
            rid_binary_threshold: config.rid_binary_threshold,
        }
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A secondary index
///
/// ## Concurrency:
/// - `inner`: one RwLock per index. Reads take it shared, structural
///   writes exclusive; the lock spans the whole operation, including any
///   optimization pass it triggers
/// - `status`: atomic, readable without the lock
/// - `pressure`: the pending memory-pressure level, set by the watchdog and
///   consumed only under the exclusive lock
pub struct Index {
    name: String,
    inner: RwLock<IndexInner>,
    status: AtomicU8,
    pressure: Mutex<Option<PressureSubscription>>,
    extractor: Option<Arc<dyn ValueExtractor>>,
}

struct IndexInner {
    definition: IndexDefinition,
    store: Arc<dyn NodeStore>,
    map: PersistentTreeMap<IndexKey, RidSet>,
    settings: IndexSettings,
}

impl Index {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create an empty index backed by a fresh tree in `store`
    pub fn create(
        definition: IndexDefinition,
        store: Arc<dyn NodeStore>,
        settings: IndexSettings,
        monitor: Option<&MemoryMonitor>,
        extractor: Option<Arc<dyn ValueExtractor>>,
    ) -> Result<Self> {
        let map = PersistentTreeMap::create(Arc::clone(&store), settings.tree)?;
        tracing::info!(
            "Created {} index '{}' on {:?} (root {})",
            definition.kind,
            definition.name,
            definition.containers,
            map.root_id()
        );

        let index = Self::assemble(definition, store, map, settings, monitor, extractor);
        index.set_status(IndexStatus::Ready);
        Ok(index)
    }

    /// Reopen an index from its configuration snapshot
    ///
    /// Fails with `MissingRoot` if the snapshot has no root reference or
    /// the referenced root is not in `store`.
    pub fn load_from_configuration(
        snapshot: &IndexSnapshot,
        store: Arc<dyn NodeStore>,
        settings: IndexSettings,
        monitor: Option<&MemoryMonitor>,
        extractor: Option<Arc<dyn ValueExtractor>>,
    ) -> Result<Self> {
        let root = snapshot.map_root_ref.ok_or_else(|| {
            AtlasError::MissingRoot(format!("Index '{}' has no map root reference", snapshot.name))
        })?;
        if !store.contains(root) {
            return Err(AtlasError::MissingRoot(format!(
                "Root {} of index '{}' does not exist",
                root, snapshot.name
            )));
        }

        let map = PersistentTreeMap::open(Arc::clone(&store), root, settings.tree)?;
        tracing::info!(
            "Loaded index '{}' ({} keys, root {})",
            snapshot.name,
            map.size(),
            root
        );

        let index = Self::assemble(snapshot.definition(), store, map, settings, monitor, extractor);
        index.set_status(IndexStatus::Ready);
        Ok(index)
    }

    fn assemble(
        definition: IndexDefinition,
        store: Arc<dyn NodeStore>,
        map: PersistentTreeMap<IndexKey, RidSet>,
        settings: IndexSettings,
        monitor: Option<&MemoryMonitor>,
        extractor: Option<Arc<dyn ValueExtractor>>,
    ) -> Self {
        let extractor = extractor.or_else(|| {
            definition
                .field
                .as_ref()
                .map(|field| Arc::new(FieldExtractor::new(field.clone(), definition.key_type)) as Arc<dyn ValueExtractor>)
        });

        Self {
            name: definition.name.clone(),
            inner: RwLock::new(IndexInner {
                definition,
                store,
                map,
                settings,
            }),
            status: AtomicU8::new(IndexStatus::Unloaded as u8),
            pressure: Mutex::new(monitor.map(MemoryMonitor::subscribe)),
            extractor,
        }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn definition(&self) -> IndexDefinition {
        self.inner.read().definition.clone()
    }

    pub fn kind(&self) -> IndexKind {
        self.inner.read().definition.kind
    }

    pub fn is_automatic(&self) -> bool {
        self.inner.read().definition.automatic
    }

    /// Whether records of `container` feed this index
    pub fn watches(&self, container: &str) -> bool {
        self.inner.read().definition.watches(container)
    }

    /// Key a record is indexed under, `None` if not indexed or no extractor
    pub fn key_for(&self, record: &Record) -> Result<Option<IndexKey>> {
        match &self.extractor {
            Some(extractor) => extractor.value_to_index(record),
            None => Ok(None),
        }
    }

    /// Configuration snapshot including the current root reference
    pub fn snapshot(&self) -> IndexSnapshot {
        let inner = self.inner.read();
        inner.definition.to_snapshot(Some(inner.map.root_id()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Identifiers under `key`; empty if the key is absent
    pub fn get(&self, key: &IndexKey) -> Result<BTreeSet<RecordId>> {
        let inner = self.read_guard()?;
        match inner.map.get(key)? {
            Some(set) => inner.to_set(&set),
            None => Ok(BTreeSet::new()),
        }
    }

    pub fn contains(&self, key: &IndexKey) -> Result<bool> {
        let inner = self.read_guard()?;
        Ok(inner.map.get(key)?.is_some_and(|set| !set.is_empty()))
    }

    /// Ordered `(key, identifiers)` pairs between two bounds
    pub fn range_entries(
        &self,
        from: &IndexKey,
        to: &IndexKey,
        inclusive_from: bool,
        inclusive_to: bool,
    ) -> Result<Vec<(IndexKey, BTreeSet<RecordId>)>> {
        let inner = self.read_guard()?;
        inner
            .map
            .range(from, to, inclusive_from, inclusive_to)?
            .into_iter()
            .map(|(key, set)| Ok((key, inner.to_set(&set)?)))
            .collect()
    }

    /// Union of the identifiers of every key between two bounds
    pub fn get_between(
        &self,
        from: &IndexKey,
        to: &IndexKey,
        inclusive_from: bool,
        inclusive_to: bool,
    ) -> Result<BTreeSet<RecordId>> {
        let mut out = BTreeSet::new();
        for (_, rids) in self.range_entries(from, to, inclusive_from, inclusive_to)? {
            out.extend(rids);
        }
        Ok(out)
    }

    /// Every entry in key order
    pub fn entries(&self) -> Result<Vec<(IndexKey, BTreeSet<RecordId>)>> {
        self.cursor(Bound::Unbounded, Bound::Unbounded)?.collect()
    }

    /// Lazily advancing scan; the shared lock is taken per step
    pub fn cursor(&self, lower: Bound<IndexKey>, upper: Bound<IndexKey>) -> Result<IndexCursor<'_>> {
        if let (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) = (&lower, &upper) {
            if !a.comparable_with(b) {
                return Err(AtlasError::InvalidRange(format!(
                    "Cursor bounds are of different types: {:?} and {:?}",
                    a, b
                )));
            }
        }

        let inner = self.read_guard()?;
        let cursor = inner.map.cursor(lower, upper);
        Ok(IndexCursor { index: self, cursor })
    }

    /// Number of keys
    pub fn size(&self) -> Result<u64> {
        Ok(self.read_guard()?.map.size())
    }

    /// Number of keys holding `rid` (scans the whole index)
    pub fn count(&self, rid: RecordId) -> Result<usize> {
        Ok(self.read_guard()?.keys_containing(rid)?.len())
    }

    /// Encoding of the identifier set under `key`
    pub fn value_encoding(&self, key: &IndexKey) -> Result<Option<ValueEncoding>> {
        Ok(self.read_guard()?.map.get(key)?.map(|set| set.encoding()))
    }

    pub fn in_memory_entries(&self) -> usize {
        self.inner.read().map.in_memory_entries()
    }

    pub fn resident_nodes(&self) -> usize {
        self.inner.read().map.resident_nodes()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&self, key: &IndexKey, rid: RecordId) -> Result<()> {
        self.write_guard()?.put(key, rid)
    }

    /// Remove a key with all its identifiers
    pub fn remove_key(&self, key: &IndexKey) -> Result<bool> {
        self.write_guard()?.remove_key(key)
    }

    /// Remove one identifier from a key; an emptied key is removed
    pub fn remove_entry(&self, key: &IndexKey, rid: RecordId) -> Result<bool> {
        self.write_guard()?.remove_entry(key, rid)
    }

    /// Remove `rid` from every key (scans the whole index); returns keys touched
    pub fn remove_record(&self, rid: RecordId) -> Result<usize> {
        self.write_guard()?.remove_record(rid)
    }

    pub fn clear(&self) -> Result<()> {
        self.write_guard()?.map.clear()
    }

    /// Apply a buffered batch of operations in buffering order
    ///
    /// The result stays in memory until `commit_changes`; `unload` drops it.
    pub fn commit(&self, batch: &CommitBatch) -> Result<()> {
        let mut inner = self.write_guard()?;
        inner.apply(batch)?;
        tracing::debug!(
            "Index '{}' applied {} operations on {} keys",
            self.name,
            batch.operation_count(),
            batch.key_count()
        );
        Ok(())
    }

    /// Repopulate the index from the watched containers
    ///
    /// On failure the index is left empty and `IndexBuild` is returned.
    pub fn rebuild(&self, records: &dyn RecordStore, mut listener: Option<&mut dyn ProgressListener>) -> Result<u64> {
        let mut inner = self.write_guard()?;
        self.set_status(IndexStatus::Loading);

        let result = match (inner.map.clear(), &self.extractor) {
            (Err(e), _) => Err(e),
            // Manual indexes without an extractor are only cleared
            (Ok(()), None) => Ok(0),
            (Ok(()), Some(extractor)) => {
                records.declare_intent(Some(Intent::MassiveInsert));
                let _intent = IntentGuard { records };
                inner.fill(records, extractor.as_ref(), &mut listener)
            }
        };

        self.set_status(IndexStatus::Ready);

        match result {
            Ok(count) => {
                inner.map.commit_changes()?;
                if let Some(listener) = listener.as_deref_mut() {
                    listener.on_completion(true);
                }
                tracing::info!("Index '{}' rebuilt from {} records", self.name, count);
                Ok(count)
            }
            Err(e) => {
                if let Err(clear_err) = inner.map.clear() {
                    tracing::error!("Cannot clear index '{}' after failed rebuild: {}", self.name, clear_err);
                }
                if let Some(listener) = listener.as_deref_mut() {
                    listener.on_completion(false);
                }
                tracing::warn!("Rebuild of index '{}' failed: {}", self.name, e);
                Err(AtlasError::IndexBuild {
                    containers: inner.definition.containers.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Watch another container; returns `false` if already watched
    pub fn add_container(&self, container: &str) -> Result<bool> {
        Ok(self.write_guard()?.definition.add_container(container.to_string()))
    }

    /// Stop watching a container; returns `false` if it was not watched
    pub fn remove_container(&self, container: &str) -> Result<bool> {
        Ok(self.write_guard()?.definition.remove_container(container))
    }

    // =========================================================================
    // Residency & Durability
    // =========================================================================

    /// Flush and evict resident leaves; returns the number evicted
    pub fn optimize(&self, hard: bool) -> Result<usize> {
        let mut inner = self.write_guard()?;
        self.run_optimization(&mut inner, hard)
    }

    pub fn lazy_save(&self) -> Result<usize> {
        self.write_guard()?.map.lazy_save()
    }

    pub fn commit_changes(&self) -> Result<usize> {
        self.write_guard()?.map.commit_changes()
    }

    /// Drop unsaved changes and residency, reloading from the store
    pub fn unload(&self) -> Result<()> {
        self.write_guard()?.map.unload()
    }

    /// Flush, unsubscribe from memory pressure and reject further operations
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if self.status() == IndexStatus::Closed {
            return Ok(());
        }

        inner.map.commit_changes()?;
        self.set_status(IndexStatus::Closed);
        self.pressure.lock().take();

        tracing::info!("Closed index '{}'", self.name);
        Ok(())
    }

    /// Delete every node of the index and close it
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.write_guard()?;
        inner.map.delete()?;
        self.set_status(IndexStatus::Closed);
        self.pressure.lock().take();

        tracing::info!("Deleted index '{}'", self.name);
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn set_status(&self, status: IndexStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<()> {
        if self.status() == IndexStatus::Closed {
            return Err(AtlasError::ClosedIndex(self.name.clone()));
        }
        Ok(())
    }

    fn pending_pressure(&self) -> PressureLevel {
        self.pressure
            .lock()
            .as_ref()
            .map(PressureSubscription::pending)
            .unwrap_or_default()
    }

    /// Shared lock, after running any pending optimization under the exclusive one
    fn read_guard(&self) -> Result<RwLockReadGuard<'_, IndexInner>> {
        if self.pending_pressure() != PressureLevel::None {
            let mut inner = self.inner.write();
            self.check_open()?;
            self.check_for_optimization(&mut inner)?;
            return Ok(RwLockWriteGuard::downgrade(inner));
        }

        let inner = self.inner.read();
        self.check_open()?;
        Ok(inner)
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, IndexInner>> {
        let mut inner = self.inner.write();
        self.check_open()?;
        self.check_for_optimization(&mut inner)?;
        Ok(inner)
    }

    /// Consume the pending pressure level; must be called under the exclusive lock
    ///
    /// The flag is swapped to `None` before the pass, so a signal arriving
    /// during the pass re-arms it for the next operation.
    fn check_for_optimization(&self, inner: &mut IndexInner) -> Result<()> {
        let level = self
            .pressure
            .lock()
            .as_ref()
            .map(PressureSubscription::take)
            .unwrap_or_default();

        match level {
            PressureLevel::None => Ok(()),
            PressureLevel::Soft => self.run_optimization(inner, false).map(|_| ()),
            PressureLevel::Hard => self.run_optimization(inner, true).map(|_| ()),
        }
    }

    fn run_optimization(&self, inner: &mut IndexInner, hard: bool) -> Result<usize> {
        self.set_status(IndexStatus::Optimizing);
        let result = inner.map.optimize(hard);
        self.set_status(IndexStatus::Ready);

        let evicted = result?;
        tracing::debug!(
            "Optimized index '{}' ({}): evicted {} leaves, {} entries resident",
            self.name,
            if hard { "hard" } else { "soft" },
            evicted,
            inner.map.in_memory_entries()
        );
        Ok(evicted)
    }
}

impl IndexInner {
    fn rid_ctx(&self) -> RidSetContext {
        RidSetContext {
            store: Arc::clone(&self.store),
            binary_threshold: self.settings.rid_binary_threshold,
            settings: self.settings.rid_tree,
        }
    }

    fn to_set(&self, set: &RidSet) -> Result<BTreeSet<RecordId>> {
        set.to_set(&self.rid_ctx())
    }

    fn put(&mut self, key: &IndexKey, rid: RecordId) -> Result<()> {
        for stored in self.definition.kind.keys_for(key) {
            self.put_stored(stored, rid)?;
        }
        Ok(())
    }

    fn put_stored(&mut self, key: IndexKey, rid: RecordId) -> Result<()> {
        let ctx = self.rid_ctx();
        let current = self.map.get(&key)?.unwrap_or_default();

        let present = current.contains(&ctx, &rid)?;
        match self.definition.kind {
            IndexKind::Unique if !current.is_empty() && !present => {
                return Err(AtlasError::DuplicateKey {
                    index: self.definition.name.clone(),
                    key: key.to_string(),
                });
            }
            IndexKind::Dictionary if present && current.len() == 1 => return Ok(()),
            IndexKind::Unique | IndexKind::NotUnique | IndexKind::FullText if present => return Ok(()),
            _ => {}
        }

        let mut set = self.writable(current)?;
        let was_external = set.is_external();
        if self.definition.kind == IndexKind::Dictionary && !set.is_empty() {
            set.replace_with(&ctx, rid)?;
        } else {
            set.insert(&ctx, rid)?;
        }
        if !was_external {
            self.map.stage(&set);
        }

        self.map.put(key, set)?;
        Ok(())
    }

    fn remove_key(&mut self, key: &IndexKey) -> Result<bool> {
        let mut removed = false;
        for stored in self.definition.kind.keys_for(key) {
            if let Some(set) = self.map.remove(&stored)? {
                self.map.retire(set)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn remove_entry(&mut self, key: &IndexKey, rid: RecordId) -> Result<bool> {
        let mut removed = false;
        for stored in self.definition.kind.keys_for(key) {
            removed |= self.remove_stored(stored, rid)?;
        }
        Ok(removed)
    }

    fn remove_stored(&mut self, key: IndexKey, rid: RecordId) -> Result<bool> {
        let ctx = self.rid_ctx();
        let Some(set) = self.map.get(&key)? else {
            return Ok(false);
        };
        if !set.contains(&ctx, &rid)? {
            return Ok(false);
        }

        // Empty sets remove the key
        if set.len() == 1 {
            self.map.remove(&key)?;
            self.map.retire(set)?;
            return Ok(true);
        }

        let mut set = self.writable(set)?;
        set.remove(&ctx, &rid)?;
        self.map.put(key, set)?;
        Ok(true)
    }

    /// A set safe to mutate: an external set the persisted tree may still
    /// reference is copied, and the original retired
    fn writable(&mut self, set: RidSet) -> Result<RidSet> {
        match set.owned_root() {
            Some(root) if !self.map.is_staged(root) => {
                let copy = set.detach(&self.rid_ctx())?;
                self.map.stage(&copy);
                self.map.retire(set)?;
                Ok(copy)
            }
            _ => Ok(set),
        }
    }

    fn remove_record(&mut self, rid: RecordId) -> Result<usize> {
        let keys = self.keys_containing(rid)?;
        for key in &keys {
            self.remove_stored(key.clone(), rid)?;
        }
        Ok(keys.len())
    }

    fn keys_containing(&self, rid: RecordId) -> Result<Vec<IndexKey>> {
        let ctx = self.rid_ctx();
        let mut cursor = self.map.cursor(Bound::Unbounded, Bound::Unbounded);
        let mut keys = Vec::new();
        while let Some((key, set)) = cursor.next_entry(&self.map)? {
            if set.contains(&ctx, &rid)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Replay a batch; nothing is flushed until `commit_changes`
    fn apply(&mut self, batch: &CommitBatch) -> Result<()> {
        self.map.hold_writes();

        if batch.clear {
            self.map.clear()?;
        }

        for (key, operations) in batch.entries() {
            for op in operations {
                match (op.status, key, op.value) {
                    (IndexOpStatus::Put, OperationKey::Key(key), Some(rid)) => self.put(key, rid)?,
                    (IndexOpStatus::Put, _, _) => {
                        return Err(AtlasError::Transaction(format!(
                            "PUT on index '{}' needs a key and a value",
                            self.definition.name
                        )))
                    }
                    (IndexOpStatus::Remove, OperationKey::Wildcard, Some(rid)) => {
                        self.remove_record(rid)?;
                    }
                    (IndexOpStatus::Remove, OperationKey::Wildcard, None) => self.map.clear()?,
                    (IndexOpStatus::Remove, OperationKey::Key(key), None) => {
                        self.remove_key(key)?;
                    }
                    (IndexOpStatus::Remove, OperationKey::Key(key), Some(rid)) => {
                        self.remove_entry(key, rid)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn fill(
        &mut self,
        records: &dyn RecordStore,
        extractor: &dyn ValueExtractor,
        listener: &mut Option<&mut dyn ProgressListener>,
    ) -> Result<u64> {
        let containers = self.definition.containers.clone();

        let mut total = 0;
        for container in &containers {
            total += records.count_elements(container)?;
        }
        if let Some(listener) = listener.as_deref_mut() {
            listener.on_begin(total);
        }

        let mut done = 0u64;
        for container in &containers {
            for record in records.browse_container(container)? {
                let record = record?;
                let key = extractor.value_to_index(&record)?;
                if let (Some(key), Some(rid)) = (key, record.id) {
                    self.put(&key, rid)?;
                }

                done += 1;
                if let Some(listener) = listener.as_deref_mut() {
                    let percent = if total == 0 {
                        100.0
                    } else {
                        done as f32 * 100.0 / total as f32
                    };
                    listener.on_progress(done, percent)?;
                }
            }
        }

        Ok(done)
    }
}

/// Clears the declared record-store intent when dropped
struct IntentGuard<'a> {
    records: &'a dyn RecordStore,
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        self.records.declare_intent(None);
    }
}

/// Iterator over an index range
///
/// Takes the index's shared lock for each step only. Leaves already visited
/// stay pinned until the iterator is exhausted or dropped.
pub struct IndexCursor<'a> {
    index: &'a Index,
    cursor: Cursor<IndexKey, RidSet>,
}

impl IndexCursor<'_> {
    /// Release pinned leaves early
    pub fn close(mut self) {
        self.cursor.close();
    }
}

impl Iterator for IndexCursor<'_> {
    type Item = Result<(IndexKey, BTreeSet<RecordId>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = match self.index.read_guard() {
            Ok(inner) => inner,
            Err(e) => {
                self.cursor.close();
                return Some(Err(e));
            }
        };

        match self.cursor.next_entry(&inner.map) {
            Ok(Some((key, set))) => Some(inner.to_set(&set).map(|rids| (key, rids))),
            Ok(None) => None,
            Err(e) => {
                self.cursor.close();
                Some(Err(e))
            }
        }
    }
}
