//! Transactions
//!
//! Two implementations of the same record-operation surface: `NoTx`
//! applies everything immediately, `OptimisticTransaction` buffers until
//! commit. The database holds one of them in an `ActiveTransaction`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{AtlasError, Result};
use crate::index::{Index, IndexManager};
use crate::record::{Record, RecordId, RecordStore};

use super::{CommitBatch, IndexOperation, RecordEntry, RecordStatus};

/// Collaborators a transaction works against
#[derive(Clone, Copy)]
pub struct TxContext<'a> {
    pub records: &'a dyn RecordStore,
    pub indexes: &'a IndexManager,
}

/// Mode of the active transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    NoTx,
    Optimistic,
}

/// Result of a successful commit
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Temporary identity -> persisted identity
    pub remapped: HashMap<RecordId, RecordId>,

    /// Every persisted identity saved or deleted by the commit
    pub touched: Vec<RecordId>,
}

/// Record and index operations, buffered or immediate
pub trait RecordOperations {
    /// Serial of the transaction
    fn id(&self) -> u64;

    fn begin(&mut self) -> Result<()>;

    /// Load a record, seeing this transaction's own changes
    fn load(&self, ctx: TxContext<'_>, id: RecordId) -> Result<Option<Record>>;

    /// Save a record, assigning its identity if it has none
    fn save(&mut self, ctx: TxContext<'_>, record: &mut Record, container_hint: Option<&str>) -> Result<RecordId>;

    /// Delete a record; returns whether it existed
    fn delete(&mut self, ctx: TxContext<'_>, id: RecordId) -> Result<bool>;

    /// Record an index mutation
    fn add_index_entry(&mut self, ctx: TxContext<'_>, index: &str, op: IndexOperation) -> Result<()>;

    /// Empty an index
    fn clear_index(&mut self, ctx: TxContext<'_>, index: &str) -> Result<()>;

    fn commit(&mut self, ctx: TxContext<'_>) -> Result<CommitOutcome>;

    fn rollback(&mut self, ctx: TxContext<'_>) -> Result<()>;
}

// =============================================================================
// NoTx
// =============================================================================

/// Every operation takes effect immediately
#[derive(Debug)]
pub struct NoTx {
    id: u64,
}

impl NoTx {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// Apply and flush one batch; a failed batch is dropped as a whole
    fn apply(index: &Index, batch: &CommitBatch) -> Result<()> {
        if let Err(e) = index.commit(batch).and_then(|_| index.commit_changes().map(|_| ())) {
            if let Err(unload_err) = index.unload() {
                tracing::error!("Cannot unload index '{}': {}", index.name(), unload_err);
            }
            return Err(e);
        }
        Ok(())
    }
}

impl RecordOperations for NoTx {
    fn id(&self) -> u64 {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn load(&self, ctx: TxContext<'_>, id: RecordId) -> Result<Option<Record>> {
        ctx.records.load(id)
    }

    fn save(&mut self, ctx: TxContext<'_>, record: &mut Record, container_hint: Option<&str>) -> Result<RecordId> {
        let id = ctx.records.save(record, container_hint)?;
        record.id = Some(id);
        Ok(id)
    }

    fn delete(&mut self, ctx: TxContext<'_>, id: RecordId) -> Result<bool> {
        ctx.records.delete(id)
    }

    fn add_index_entry(&mut self, ctx: TxContext<'_>, index: &str, op: IndexOperation) -> Result<()> {
        let mut batch = CommitBatch::new();
        batch.push(op);
        Self::apply(&*ctx.indexes.get(index)?, &batch)
    }

    fn clear_index(&mut self, ctx: TxContext<'_>, index: &str) -> Result<()> {
        let mut batch = CommitBatch::new();
        batch.clear_all();
        Self::apply(&*ctx.indexes.get(index)?, &batch)
    }

    fn commit(&mut self, _ctx: TxContext<'_>) -> Result<CommitOutcome> {
        Ok(CommitOutcome::default())
    }

    fn rollback(&mut self, _ctx: TxContext<'_>) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// OptimisticTransaction
// =============================================================================

/// Buffers record and index mutations until commit
///
/// ## Commit protocol
/// 1. Persist buffered records, remapping temporary identities
/// 2. Replay each index batch through `Index::commit`
/// 3. `commit_changes` on each touched index
/// 4. Clear the buffers
///
/// If any step fails the buffers are discarded and every touched index is
/// unloaded, so no half-applied state stays resident.
#[derive(Debug)]
pub struct OptimisticTransaction {
    id: u64,
    active: bool,

    /// Record entries in first-touch order
    records: Vec<RecordEntry>,
    positions: HashMap<RecordId, usize>,

    /// Lowercase index name -> batch
    indexes: BTreeMap<String, CommitBatch>,

    next_temp_position: i64,
}

impl OptimisticTransaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            active: false,
            records: Vec::new(),
            positions: HashMap::new(),
            indexes: BTreeMap::new(),
            next_temp_position: -2,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Buffered batch of every touched index
    pub fn index_entries(&self) -> impl Iterator<Item = (&str, &CommitBatch)> {
        self.indexes.iter().map(|(name, batch)| (name.as_str(), batch))
    }

    /// Buffered batch of one index
    pub fn index_batch(&self, index: &str) -> Option<&CommitBatch> {
        self.indexes.get(&index.to_lowercase())
    }

    /// Every index batch as `{index: {clear?, entries: {...}}}`
    pub fn index_entries_document(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.indexes)?)
    }

    /// Buffered record entries of a class (`None` = all), in first-touch order
    pub fn record_entries_by_class(&self, class_name: Option<&str>) -> Vec<&RecordEntry> {
        self.records
            .iter()
            .filter(|entry| match class_name {
                None => true,
                Some(name) => entry
                    .record
                    .class_name
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(name)),
            })
            .collect()
    }

    /// Buffered record entries of some containers (`None` = all)
    pub fn record_entries_by_container_ids(&self, cluster_ids: Option<&[u32]>) -> Vec<&RecordEntry> {
        self.records
            .iter()
            .filter(|entry| match (cluster_ids, entry.id()) {
                (None, _) => true,
                (Some(ids), Some(id)) => ids.contains(&id.cluster),
                (Some(_), None) => false,
            })
            .collect()
    }

    pub fn record_entry(&self, id: RecordId) -> Option<&RecordEntry> {
        self.positions.get(&id).map(|&pos| &self.records[pos])
    }

    fn put_record_entry(&mut self, id: RecordId, entry: RecordEntry) {
        match self.positions.get(&id) {
            Some(&pos) => self.records[pos] = entry,
            None => {
                self.positions.insert(id, self.records.len());
                self.records.push(entry);
            }
        }
    }

    fn drop_record_entry(&mut self, id: RecordId) {
        if let Some(pos) = self.positions.remove(&id) {
            self.records.remove(pos);
            for p in self.positions.values_mut() {
                if *p > pos {
                    *p -= 1;
                }
            }
        }
    }

    fn discard(&mut self) {
        self.records.clear();
        self.positions.clear();
        self.indexes.clear();
        self.active = false;
    }

    /// Indexes with buffered batches that still exist
    fn touched_indexes(&self, ctx: TxContext<'_>) -> Vec<Arc<Index>> {
        self.indexes.keys().filter_map(|name| ctx.indexes.find(name)).collect()
    }

    fn unload_all(indexes: &[Arc<Index>]) {
        for index in indexes {
            if let Err(e) = index.unload() {
                tracing::warn!("Cannot unload index '{}': {}", index.name(), e);
            }
        }
    }

    fn persist_records(&self, ctx: TxContext<'_>, outcome: &mut CommitOutcome) -> Result<()> {
        for entry in &self.records {
            match entry.status {
                RecordStatus::Created | RecordStatus::Updated => {
                    let id = ctx.records.save(&entry.record, entry.container_hint.as_deref())?;
                    if let Some(old) = entry.id() {
                        if old != id {
                            outcome.remapped.insert(old, id);
                        }
                    }
                    outcome.touched.push(id);
                }
                RecordStatus::Deleted => {
                    if let Some(id) = entry.id() {
                        ctx.records.delete(id)?;
                        outcome.touched.push(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_indexes(&self, ctx: TxContext<'_>, remap: &HashMap<RecordId, RecordId>) -> Result<Vec<Arc<Index>>> {
        let mut applied = Vec::with_capacity(self.indexes.len());
        for (name, batch) in &self.indexes {
            let index = ctx.indexes.get(name)?;
            index.commit(&batch.remapped(remap))?;
            applied.push(index);
        }
        Ok(applied)
    }
}

impl RecordOperations for OptimisticTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(AtlasError::Transaction(format!("Transaction {} already begun", self.id)));
        }
        self.active = true;
        tracing::debug!("Transaction {} begun", self.id);
        Ok(())
    }

    fn load(&self, ctx: TxContext<'_>, id: RecordId) -> Result<Option<Record>> {
        match self.record_entry(id) {
            Some(entry) if entry.status == RecordStatus::Deleted => Ok(None),
            Some(entry) => Ok(Some(entry.record.clone())),
            None => ctx.records.load(id),
        }
    }

    fn save(&mut self, ctx: TxContext<'_>, record: &mut Record, container_hint: Option<&str>) -> Result<RecordId> {
        let (id, status) = match record.id {
            Some(id) => {
                let status = match self.record_entry(id).map(|e| e.status) {
                    Some(RecordStatus::Created) => RecordStatus::Created,
                    _ if id.is_temporary() => RecordStatus::Created,
                    _ => RecordStatus::Updated,
                };
                (id, status)
            }
            None => {
                let cluster = ctx.records.container_id(container_hint.unwrap_or(&record.container))?;
                let id = RecordId::new(cluster, self.next_temp_position);
                self.next_temp_position -= 1;
                (id, RecordStatus::Created)
            }
        };

        record.id = Some(id);
        self.put_record_entry(
            id,
            RecordEntry {
                status,
                record: record.clone(),
                container_hint: container_hint.map(str::to_string),
            },
        );
        Ok(id)
    }

    fn delete(&mut self, ctx: TxContext<'_>, id: RecordId) -> Result<bool> {
        let existing = self.record_entry(id).map(|e| (e.status, e.record.clone()));
        let record = match existing {
            Some((RecordStatus::Deleted, _)) => return Ok(false),
            // Created and deleted in the same transaction: nothing to persist
            Some((RecordStatus::Created, _)) => {
                self.drop_record_entry(id);
                return Ok(true);
            }
            Some((RecordStatus::Updated, record)) => record,
            None => match ctx.records.load(id)? {
                Some(record) => record,
                None => return Ok(false),
            },
        };

        self.put_record_entry(
            id,
            RecordEntry {
                status: RecordStatus::Deleted,
                record,
                container_hint: None,
            },
        );
        Ok(true)
    }

    fn add_index_entry(&mut self, ctx: TxContext<'_>, index: &str, op: IndexOperation) -> Result<()> {
        let index = ctx.indexes.get(index)?;
        self.indexes.entry(index.name().to_lowercase()).or_default().push(op);
        Ok(())
    }

    fn clear_index(&mut self, ctx: TxContext<'_>, index: &str) -> Result<()> {
        let index = ctx.indexes.get(index)?;
        self.indexes.entry(index.name().to_lowercase()).or_default().clear_all();
        Ok(())
    }

    fn commit(&mut self, ctx: TxContext<'_>) -> Result<CommitOutcome> {
        if !self.active {
            return Err(AtlasError::Transaction(format!("Transaction {} is not active", self.id)));
        }

        let touched = self.touched_indexes(ctx);
        let mut outcome = CommitOutcome::default();

        // Step 1-2: Records, then index batches
        let applied = self
            .persist_records(ctx, &mut outcome)
            .and_then(|_| self.apply_indexes(ctx, &outcome.remapped));
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                tracing::warn!("Commit of transaction {} failed: {}", self.id, e);
                self.discard();
                Self::unload_all(&touched);
                return Err(e);
            }
        };

        // Step 3: Durability
        for index in &applied {
            if let Err(e) = index.commit_changes() {
                tracing::error!("Cannot flush index '{}': {}", index.name(), e);
                self.discard();
                Self::unload_all(&touched);
                return Err(e);
            }
        }

        // Step 4: Clear buffers
        tracing::debug!(
            "Transaction {} committed: {} records, {} indexes",
            self.id,
            self.records.len(),
            applied.len()
        );
        self.discard();
        Ok(outcome)
    }

    fn rollback(&mut self, ctx: TxContext<'_>) -> Result<()> {
        let touched = self.touched_indexes(ctx);
        self.discard();
        Self::unload_all(&touched);
        tracing::debug!("Transaction {} rolled back", self.id);
        Ok(())
    }
}

// =============================================================================
// ActiveTransaction
// =============================================================================

/// The transaction currently installed in a database
#[derive(Debug)]
pub enum ActiveTransaction {
    NoTx(NoTx),
    Optimistic(OptimisticTransaction),
}

impl ActiveTransaction {
    pub fn mode(&self) -> TxMode {
        match self {
            ActiveTransaction::NoTx(_) => TxMode::NoTx,
            ActiveTransaction::Optimistic(_) => TxMode::Optimistic,
        }
    }

    pub fn as_optimistic(&self) -> Option<&OptimisticTransaction> {
        match self {
            ActiveTransaction::Optimistic(tx) => Some(tx),
            ActiveTransaction::NoTx(_) => None,
        }
    }

    fn ops(&self) -> &dyn RecordOperations {
        match self {
            ActiveTransaction::NoTx(tx) => tx,
            ActiveTransaction::Optimistic(tx) => tx,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn RecordOperations {
        match self {
            ActiveTransaction::NoTx(tx) => tx,
            ActiveTransaction::Optimistic(tx) => tx,
        }
    }
}

impl RecordOperations for ActiveTransaction {
    fn id(&self) -> u64 {
        self.ops().id()
    }

    fn begin(&mut self) -> Result<()> {
        self.ops_mut().begin()
    }

    fn load(&self, ctx: TxContext<'_>, id: RecordId) -> Result<Option<Record>> {
        self.ops().load(ctx, id)
    }

    fn save(&mut self, ctx: TxContext<'_>, record: &mut Record, container_hint: Option<&str>) -> Result<RecordId> {
        self.ops_mut().save(ctx, record, container_hint)
    }

    fn delete(&mut self, ctx: TxContext<'_>, id: RecordId) -> Result<bool> {
        self.ops_mut().delete(ctx, id)
    }

    fn add_index_entry(&mut self, ctx: TxContext<'_>, index: &str, op: IndexOperation) -> Result<()> {
        self.ops_mut().add_index_entry(ctx, index, op)
    }

    fn clear_index(&mut self, ctx: TxContext<'_>, index: &str) -> Result<()> {
        self.ops_mut().clear_index(ctx, index)
    }

    fn commit(&mut self, ctx: TxContext<'_>) -> Result<CommitOutcome> {
        self.ops_mut().commit(ctx)
    }

    fn rollback(&mut self, ctx: TxContext<'_>) -> Result<()> {
        self.ops_mut().rollback(ctx)
    }
}
