//! Database handle
//!
//! Front-end gating the transaction lifecycle.
//!
//! ## Responsibilities
//! - NO_TX / OPTIMISTIC state machine around the active transaction
//! - Lifecycle listeners (best effort)
//! - Automatic maintenance of the indexes watching a record's container
//! - Cache of persisted records, invalidated when a commit fails

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::error::Result;
use crate::index::{Index, IndexDefinition, IndexManager, ValueExtractor};
use crate::memory::{MemoryMonitor, SystemMemoryProbe};
use crate::record::{MemoryRecordStore, Record, RecordId, RecordStore};
use crate::tx::{
    ActiveTransaction, IndexOperation, NoTx, OptimisticTransaction, RecordOperations, TxContext, TxMode,
};

use super::{DatabaseListener, RecordCache};

/// An open database
///
/// ## Concurrency Model
///
/// - **Transaction**: one active transaction per database, behind `tx`.
///   Every record operation holds it for its whole duration, so operations
///   are serialized against commit/rollback
/// - **Indexes**: each carries its own RwLock; reads through
///   `indexes()` never touch `tx`
/// - **Listeners**: called with `tx` held and must not call back into the
///   database
pub struct Database {
    config: Config,
    records: Arc<dyn RecordStore>,
    indexes: IndexManager,
    monitor: MemoryMonitor,

    /// Active transaction (NO_TX between transactions)
    tx: Mutex<ActiveTransaction>,

    /// Serial of transaction ids
    tx_serial: AtomicU64,

    listeners: RwLock<Vec<Arc<dyn DatabaseListener>>>,

    cache: RecordCache,

    /// Whether `close` stops the monitor's watchdog
    owns_watchdog: bool,
}

impl Database {
    /// Open a database over an in-memory record store
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(MemoryRecordStore::new()), MemoryMonitor::new())
    }

    /// Open a database with explicit collaborators
    ///
    /// On startup:
    /// 1. Create the data directory (unless in memory)
    /// 2. Reload the index registry
    /// 3. Start the memory watchdog if enabled
    pub fn open_with(config: Config, records: Arc<dyn RecordStore>, monitor: MemoryMonitor) -> Result<Self> {
        // Step 1: Data directory
        if !config.in_memory {
            fs::create_dir_all(&config.data_dir)?;
        }

        // Step 2: Indexes
        let indexes = IndexManager::open(config.clone(), monitor.clone())?;

        // Step 3: Watchdog
        let owns_watchdog = config.watchdog_enabled && !monitor.watchdog_running();
        if owns_watchdog {
            monitor.start_watchdog(
                Box::new(SystemMemoryProbe::new()),
                config.watchdog_interval(),
                config.memory_soft_threshold_pct,
                config.memory_hard_threshold_pct,
            )?;
        }

        tracing::info!(
            "Opened database at {:?} ({} indexes)",
            config.data_dir,
            indexes.indexes().len()
        );

        let tx_serial = AtomicU64::new(1);
        let first = NoTx::new(tx_serial.fetch_add(1, Ordering::SeqCst));

        Ok(Self {
            config,
            records,
            indexes,
            monitor,
            tx: Mutex::new(ActiveTransaction::NoTx(first)),
            tx_serial,
            listeners: RwLock::new(Vec::new()),
            cache: RecordCache::new(),
            owns_watchdog,
        })
    }

    // =========================================================================
    // Transaction Lifecycle
    // =========================================================================

    /// Start an optimistic transaction, returning its id
    ///
    /// An open transaction is rolled back first, without notifying listeners.
    pub fn begin(&self) -> Result<u64> {
        let mut tx = self.tx.lock();

        if tx.mode() == TxMode::Optimistic {
            let previous = tx.id();
            if let Err(e) = tx.rollback(self.ctx()) {
                tracing::warn!("Implicit rollback of transaction {} failed: {}", previous, e);
            }
        }

        let id = self.next_tx_id();
        self.notify("before begin", |l| l.on_before_tx_begin(id));

        let mut optimistic = OptimisticTransaction::new(id);
        optimistic.begin()?;
        *tx = ActiveTransaction::Optimistic(optimistic);

        self.notify("after begin", |l| l.on_after_tx_begin(id));
        Ok(id)
    }

    /// Commit the active transaction; the database is back in NO_TX afterwards
    ///
    /// On failure the record cache is invalidated and the error returned.
    pub fn commit(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        let id = tx.id();

        self.notify("before commit", |l| l.on_before_tx_commit(id));
        let result = tx.commit(self.ctx());
        *tx = ActiveTransaction::NoTx(NoTx::new(self.next_tx_id()));

        match result {
            Ok(outcome) => {
                for rid in outcome.remapped.keys().chain(outcome.touched.iter()) {
                    self.cache.remove(*rid);
                }
                self.notify("after commit", |l| l.on_after_tx_commit(id));
                Ok(())
            }
            Err(e) => {
                self.cache.clear();
                Err(e)
            }
        }
    }

    /// Roll back the active transaction; the database is back in NO_TX afterwards
    pub fn rollback(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        let id = tx.id();

        self.notify("before rollback", |l| l.on_before_tx_rollback(id));
        let result = tx.rollback(self.ctx());
        *tx = ActiveTransaction::NoTx(NoTx::new(self.next_tx_id()));
        result?;

        self.notify("after rollback", |l| l.on_after_tx_rollback(id));
        Ok(())
    }

    pub fn tx_mode(&self) -> TxMode {
        self.tx.lock().mode()
    }

    pub fn current_tx_id(&self) -> u64 {
        self.tx.lock().id()
    }

    /// Inspect the buffers of the active optimistic transaction
    pub fn with_transaction<R>(&self, f: impl FnOnce(&OptimisticTransaction) -> R) -> Option<R> {
        self.tx.lock().as_optimistic().map(f)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Load a record, seeing the active transaction's changes
    pub fn load(&self, id: RecordId) -> Result<Option<Record>> {
        let tx = self.tx.lock();

        if let Some(optimistic) = tx.as_optimistic() {
            if optimistic.record_entry(id).is_some() {
                return optimistic.load(self.ctx(), id);
            }
        }

        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record));
        }

        let record = self.records.load(id)?;
        if let Some(record) = &record {
            self.cache.put(record);
        }
        Ok(record)
    }

    /// Save a record into its own container
    pub fn save(&self, record: &mut Record) -> Result<RecordId> {
        self.save_to(record, None)
    }

    /// Save a record, optionally into another container
    ///
    /// Automatic indexes watching the container get REMOVE(old key) and
    /// PUT(new key) entries for the record.
    pub fn save_to(&self, record: &mut Record, container_hint: Option<&str>) -> Result<RecordId> {
        let mut tx = self.tx.lock();
        let ctx = self.ctx();
        let container = container_hint.unwrap_or(&record.container).to_string();

        let previous = match record.id {
            Some(id) => tx.load(ctx, id)?,
            None => None,
        };

        let id = tx.save(ctx, record, container_hint)?;
        if tx.mode() == TxMode::NoTx {
            self.cache.put(record);
        }

        self.maintain_indexes(&mut tx, &container, id, previous.as_ref(), Some(&*record))?;
        Ok(id)
    }

    /// Delete a record; returns whether it existed
    pub fn delete(&self, id: RecordId) -> Result<bool> {
        let mut tx = self.tx.lock();
        let ctx = self.ctx();

        let Some(previous) = tx.load(ctx, id)? else {
            return Ok(false);
        };
        if !tx.delete(ctx, id)? {
            return Ok(false);
        }
        self.cache.remove(id);

        self.maintain_indexes(&mut tx, &previous.container, id, Some(&previous), None)?;
        Ok(true)
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Create an index and build it from the record store
    pub fn create_index(&self, definition: IndexDefinition) -> Result<Arc<Index>> {
        self.indexes.create_index(definition, &*self.records)
    }

    pub fn create_index_with_extractor(
        &self,
        definition: IndexDefinition,
        extractor: Arc<dyn ValueExtractor>,
    ) -> Result<Arc<Index>> {
        self.indexes
            .create_index_with_extractor(definition, Some(extractor), &*self.records)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes.drop_index(name)
    }

    /// Route an index operation through the active transaction
    pub fn add_index_entry(&self, index: &str, op: IndexOperation) -> Result<()> {
        self.tx.lock().add_index_entry(self.ctx(), index, op)
    }

    /// Empty an index through the active transaction
    pub fn clear_index(&self, index: &str) -> Result<()> {
        self.tx.lock().clear_index(self.ctx(), index)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn record_cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.listeners.write().push(listener);
    }

    /// Roll back any open transaction, close every index and stop the watchdog
    pub fn close(&self) -> Result<()> {
        {
            let mut tx = self.tx.lock();
            if tx.mode() == TxMode::Optimistic {
                if let Err(e) = tx.rollback(self.ctx()) {
                    tracing::warn!("Rollback on close failed: {}", e);
                }
                *tx = ActiveTransaction::NoTx(NoTx::new(self.next_tx_id()));
            }
        }

        self.indexes.close()?;
        if self.owns_watchdog {
            self.monitor.stop_watchdog();
        }
        tracing::info!("Closed database at {:?}", self.config.data_dir);
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ctx(&self) -> TxContext<'_> {
        TxContext {
            records: &*self.records,
            indexes: &self.indexes,
        }
    }

    fn next_tx_id(&self) -> u64 {
        self.tx_serial.fetch_add(1, Ordering::SeqCst)
    }

    fn notify(&self, event: &str, hook: impl Fn(&dyn DatabaseListener) -> Result<()>) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            if let Err(e) = hook(listener.as_ref()) {
                tracing::warn!("Listener failed on {}: {}", event, e);
            }
        }
    }

    fn maintain_indexes(
        &self,
        tx: &mut ActiveTransaction,
        container: &str,
        id: RecordId,
        previous: Option<&Record>,
        current: Option<&Record>,
    ) -> Result<()> {
        for index in self.indexes.automatic_indexes_for(container) {
            let old_key = match previous {
                Some(record) => index.key_for(record)?,
                None => None,
            };
            let new_key = match current {
                Some(record) => index.key_for(record)?,
                None => None,
            };
            if old_key.is_some() && old_key == new_key {
                continue;
            }

            if let Some(key) = old_key {
                tx.add_index_entry(self.ctx(), index.name(), IndexOperation::remove(key, Some(id)))?;
            }
            if let Some(key) = new_key {
                tx.add_index_entry(self.ctx(), index.name(), IndexOperation::put(key, id))?;
            }
        }
        Ok(())
    }
}
