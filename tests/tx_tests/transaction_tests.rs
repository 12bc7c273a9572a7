//! Tests for transactions
//!
//! These tests verify:
//! - NoTx applies record and index operations immediately
//! - Optimistic transactions buffer until commit
//! - Temporary identities are remapped at commit, in index batches too
//! - Buffered entries can be inspected by class, container and document
//! - Rollback and failed commits discard buffers and unload indexes
//! - A failed commit leaves external identifier sets and auto-saved
//!   indexes exactly as they were

use std::sync::Arc;

use atlasdoc::index::{IndexDefinition, IndexKey, IndexKind, IndexManager};
use atlasdoc::memory::MemoryMonitor;
use atlasdoc::record::{MemoryRecordStore, Record, RecordId, RecordStore};
use atlasdoc::tree::ValueEncoding;
use atlasdoc::tx::{
    ActiveTransaction, IndexOperation, NoTx, OptimisticTransaction, RecordOperations, RecordStatus, TxContext,
    TxMode,
};
use atlasdoc::{AtlasError, Config};

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    records: Arc<MemoryRecordStore>,
    indexes: IndexManager,
}

impl Fixture {
    fn new() -> Self {
        let config = Config::builder().in_memory(true).watchdog_enabled(false).build();
        let records = Arc::new(MemoryRecordStore::new());
        let indexes = IndexManager::open(config, MemoryMonitor::new()).unwrap();
        Self { records, indexes }
    }

    fn with_index(kind: IndexKind) -> Self {
        let fixture = Self::new();
        let definition = IndexDefinition::new("by_name", kind).on_container("Person").field("name");
        fixture.indexes.create_index(definition, &*fixture.records).unwrap();
        fixture
    }

    /// `tags` (not unique, sets go external past 2 identifiers) holding
    /// `k -> {#1:0, #1:1, #1:2}`, plus `unique_tags` holding `taken -> #1:9`
    fn with_external_sets(config: Config) -> Self {
        let records = Arc::new(MemoryRecordStore::new());
        let indexes = IndexManager::open(config, MemoryMonitor::new()).unwrap();
        let fixture = Self { records, indexes };

        let tags = fixture
            .indexes
            .create_index(IndexDefinition::new("tags", IndexKind::NotUnique), &*fixture.records)
            .unwrap();
        for position in 0..3 {
            tags.put(&key("k"), RecordId::new(1, position)).unwrap();
        }
        tags.commit_changes().unwrap();

        let unique = fixture
            .indexes
            .create_index(IndexDefinition::new("unique_tags", IndexKind::Unique), &*fixture.records)
            .unwrap();
        unique.put(&key("taken"), RecordId::new(1, 9)).unwrap();
        unique.commit_changes().unwrap();

        fixture
    }

    /// Commit `op` on `tags` together with a conflicting PUT on `unique_tags`
    fn fail_commit_with(&self, op: IndexOperation) {
        let mut tx = begun(7);
        tx.add_index_entry(self.ctx(), "tags", op).unwrap();
        tx.add_index_entry(self.ctx(), "unique_tags", IndexOperation::put(key("taken"), RecordId::new(1, 10)))
            .unwrap();

        let result = tx.commit(self.ctx());
        assert!(matches!(result, Err(AtlasError::DuplicateKey { .. })));
    }

    fn ctx(&self) -> TxContext<'_> {
        TxContext {
            records: &*self.records,
            indexes: &self.indexes,
        }
    }
}

fn person(name: &str) -> Record {
    Record::new("Person").with_class("Person").with_field("name", name)
}

fn key(name: &str) -> IndexKey {
    IndexKey::from(name)
}

fn external_config() -> Config {
    Config::builder()
        .in_memory(true)
        .rid_binary_threshold(2)
        .watchdog_enabled(false)
        .build()
}

fn original_tags() -> Vec<RecordId> {
    (0..3).map(|position| RecordId::new(1, position)).collect()
}

fn begun(id: u64) -> OptimisticTransaction {
    let mut tx = OptimisticTransaction::new(id);
    tx.begin().unwrap();
    tx
}

// =============================================================================
// NoTx Tests
// =============================================================================

#[test]
fn test_no_tx_saves_immediately() {
    let fixture = Fixture::new();
    let mut tx = NoTx::new(1);
    let mut record = person("Tom");

    let id = tx.save(fixture.ctx(), &mut record, None).unwrap();

    assert_eq!(record.id, Some(id));
    assert!(!id.is_temporary());
    assert!(fixture.records.load(id).unwrap().is_some());
    assert!(tx.delete(fixture.ctx(), id).unwrap());
    assert!(fixture.records.load(id).unwrap().is_none());
}

#[test]
fn test_no_tx_index_entries_apply_immediately() {
    let fixture = Fixture::with_index(IndexKind::NotUnique);
    let mut tx = NoTx::new(1);
    let rid = RecordId::new(1, 0);

    tx.add_index_entry(fixture.ctx(), "BY_NAME", IndexOperation::put(key("Tom"), rid))
        .unwrap();
    let index = fixture.indexes.get("by_name").unwrap();
    assert!(index.contains(&key("Tom")).unwrap());

    tx.clear_index(fixture.ctx(), "by_name").unwrap();
    assert_eq!(index.size().unwrap(), 0);
}

#[test]
fn test_no_tx_unknown_index() {
    let fixture = Fixture::new();
    let mut tx = NoTx::new(1);

    let result = tx.add_index_entry(fixture.ctx(), "missing", IndexOperation::put(key("x"), RecordId::new(1, 0)));
    assert!(matches!(result, Err(AtlasError::IndexNotFound(_))));
}

// =============================================================================
// Buffering Tests
// =============================================================================

#[test]
fn test_begin_twice_fails() {
    let mut tx = begun(7);

    assert!(tx.is_active());
    assert!(matches!(tx.begin(), Err(AtlasError::Transaction(_))));
}

#[test]
fn test_commit_without_begin_fails() {
    let fixture = Fixture::new();
    let mut tx = OptimisticTransaction::new(1);

    assert!(matches!(tx.commit(fixture.ctx()), Err(AtlasError::Transaction(_))));
}

#[test]
fn test_save_buffers_with_temporary_identity() {
    let fixture = Fixture::new();
    let mut tx = begun(1);
    let mut first = person("Tom");
    let mut second = person("Meg");

    let a = tx.save(fixture.ctx(), &mut first, None).unwrap();
    let b = tx.save(fixture.ctx(), &mut second, None).unwrap();

    assert!(a.is_temporary());
    assert_eq!(a.position, -2);
    assert_eq!(b.position, -3);
    assert_eq!(a.cluster, b.cluster);
    assert_eq!(fixture.records.count_elements("Person").unwrap(), 0);

    // The transaction sees its own writes
    let loaded = tx.load(fixture.ctx(), a).unwrap().unwrap();
    assert_eq!(loaded.field("name"), Some(&serde_json::json!("Tom")));
}

#[test]
fn test_last_write_wins() {
    let fixture = Fixture::new();
    let mut tx = begun(1);
    let mut record = person("Tom");

    let id = tx.save(fixture.ctx(), &mut record, None).unwrap();
    record.set_field("name", "Thomas");
    tx.save(fixture.ctx(), &mut record, None).unwrap();

    let entries = tx.record_entries_by_class(None);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, RecordStatus::Created);
    assert_eq!(entries[0].id(), Some(id));
    assert_eq!(entries[0].record.field("name"), Some(&serde_json::json!("Thomas")));
}

#[test]
fn test_update_and_delete_of_persisted_record() {
    let fixture = Fixture::new();
    let stored = fixture.records.save(&person("Tom"), None).unwrap();
    let mut tx = begun(1);

    let mut record = fixture.records.load(stored).unwrap().unwrap();
    record.set_field("age", 30);
    tx.save(fixture.ctx(), &mut record, None).unwrap();
    assert_eq!(tx.record_entry(stored).unwrap().status, RecordStatus::Updated);

    assert!(tx.delete(fixture.ctx(), stored).unwrap());
    assert_eq!(tx.record_entry(stored).unwrap().status, RecordStatus::Deleted);
    assert!(tx.load(fixture.ctx(), stored).unwrap().is_none());
    assert!(!tx.delete(fixture.ctx(), stored).unwrap());

    // Still there until commit
    assert!(fixture.records.load(stored).unwrap().is_some());
}

#[test]
fn test_delete_of_created_record_drops_entry() {
    let fixture = Fixture::new();
    let mut tx = begun(1);
    let mut record = person("Tom");
    let id = tx.save(fixture.ctx(), &mut record, None).unwrap();

    assert!(tx.delete(fixture.ctx(), id).unwrap());

    assert!(tx.record_entry(id).is_none());
    assert!(tx.record_entries_by_class(None).is_empty());
}

#[test]
fn test_delete_of_unknown_record() {
    let fixture = Fixture::new();
    let mut tx = begun(1);

    assert!(!tx.delete(fixture.ctx(), RecordId::new(1, 42)).unwrap());
}

#[test]
fn test_entries_by_class_and_container() {
    let fixture = Fixture::new();
    let pets = fixture.records.container_id("Pet").unwrap();
    let mut tx = begun(1);

    tx.save(fixture.ctx(), &mut person("Tom"), None).unwrap();
    tx.save(fixture.ctx(), &mut Record::new("Pet").with_class("Dog"), None).unwrap();
    tx.save(fixture.ctx(), &mut person("Meg"), None).unwrap();

    assert_eq!(tx.record_entries_by_class(Some("person")).len(), 2);
    assert_eq!(tx.record_entries_by_class(Some("Dog")).len(), 1);
    assert_eq!(tx.record_entries_by_class(Some("Cat")).len(), 0);
    assert_eq!(tx.record_entries_by_container_ids(Some(&[pets][..])).len(), 1);
    assert_eq!(tx.record_entries_by_container_ids(None).len(), 3);

    let names: Vec<_> = tx
        .record_entries_by_class(Some("Person"))
        .iter()
        .map(|e| e.record.field("name").cloned())
        .collect();
    assert_eq!(names, vec![Some(serde_json::json!("Tom")), Some(serde_json::json!("Meg"))]);
}

#[test]
fn test_index_entries_document() {
    let fixture = Fixture::with_index(IndexKind::NotUnique);
    let mut tx = begun(1);

    tx.add_index_entry(fixture.ctx(), "By_Name", IndexOperation::put(key("Tom"), RecordId::new(1, 0)))
        .unwrap();
    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::remove(key("Tom"), None))
        .unwrap();

    assert_eq!(
        tx.index_entries_document().unwrap(),
        r##"{"by_name":{"entries":{"{\"String\":\"Tom\"}":[{"status":"PUT","value":"#1:0"},{"status":"REMOVE","value":null}]}}}"##
    );
    assert_eq!(tx.index_batch("BY_NAME").unwrap().operation_count(), 2);

    // Nothing reached the index yet
    assert_eq!(fixture.indexes.get("by_name").unwrap().size().unwrap(), 0);
}

#[test]
fn test_clear_index_drops_earlier_operations() {
    let fixture = Fixture::with_index(IndexKind::NotUnique);
    let mut tx = begun(1);

    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::put(key("Tom"), RecordId::new(1, 0)))
        .unwrap();
    tx.clear_index(fixture.ctx(), "by_name").unwrap();

    let batch = tx.index_batch("by_name").unwrap();
    assert!(batch.clear);
    assert_eq!(batch.operation_count(), 0);
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_commit_persists_and_remaps() {
    let fixture = Fixture::with_index(IndexKind::NotUnique);
    let mut tx = begun(1);

    let mut record = person("Tom");
    let temp = tx.save(fixture.ctx(), &mut record, None).unwrap();
    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::put(key("Tom"), temp))
        .unwrap();

    let outcome = tx.commit(fixture.ctx()).unwrap();

    let persisted = outcome.remapped[&temp];
    assert!(!persisted.is_temporary());
    assert_eq!(outcome.touched, vec![persisted]);
    assert!(fixture.records.load(persisted).unwrap().is_some());

    let index = fixture.indexes.get("by_name").unwrap();
    assert_eq!(index.get(&key("Tom")).unwrap().into_iter().collect::<Vec<_>>(), vec![persisted]);

    assert!(!tx.is_active());
    assert!(tx.record_entries_by_class(None).is_empty());
    assert_eq!(tx.index_entries().count(), 0);
}

#[test]
fn test_commit_applies_deletes() {
    let fixture = Fixture::new();
    let stored = fixture.records.save(&person("Tom"), None).unwrap();
    let mut tx = begun(1);

    tx.delete(fixture.ctx(), stored).unwrap();
    let outcome = tx.commit(fixture.ctx()).unwrap();

    assert!(outcome.remapped.is_empty());
    assert_eq!(outcome.touched, vec![stored]);
    assert!(fixture.records.load(stored).unwrap().is_none());
}

#[test]
fn test_commit_failure_discards_and_unloads() {
    let fixture = Fixture::with_index(IndexKind::Unique);
    let index = fixture.indexes.get("by_name").unwrap();
    index.put(&key("Tom"), RecordId::new(1, 0)).unwrap();
    index.commit_changes().unwrap();

    let mut tx = begun(1);
    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::put(key("Ann"), RecordId::new(1, 5)))
        .unwrap();
    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::put(key("Tom"), RecordId::new(1, 1)))
        .unwrap();

    let result = tx.commit(fixture.ctx());

    assert!(matches!(result, Err(AtlasError::DuplicateKey { .. })));
    assert!(!tx.is_active());
    assert_eq!(tx.index_entries().count(), 0);

    // The half-applied PUT of "Ann" was unloaded with the index
    assert!(!index.contains(&key("Ann")).unwrap());
    assert_eq!(index.size().unwrap(), 1);
}

#[test]
fn test_rollback_unloads_touched_indexes() {
    let fixture = Fixture::with_index(IndexKind::NotUnique);
    let index = fixture.indexes.get("by_name").unwrap();
    index.put(&key("Tom"), RecordId::new(1, 0)).unwrap();
    index.commit_changes().unwrap();

    // An unsaved change sitting in the index's resident nodes
    index.put(&key("Meg"), RecordId::new(1, 1)).unwrap();

    let mut tx = begun(1);
    tx.add_index_entry(fixture.ctx(), "by_name", IndexOperation::put(key("Ann"), RecordId::new(1, 2)))
        .unwrap();
    tx.rollback(fixture.ctx()).unwrap();

    assert!(!tx.is_active());
    assert_eq!(tx.index_entries().count(), 0);
    assert!(!index.contains(&key("Meg")).unwrap());
    assert!(!index.contains(&key("Ann")).unwrap());
}

#[test]
fn test_failed_commit_keeps_external_set_content() {
    let fixture = Fixture::with_external_sets(external_config());
    let tags = fixture.indexes.get("tags").unwrap();
    assert_eq!(tags.value_encoding(&key("k")).unwrap(), Some(ValueEncoding::External));

    fixture.fail_commit_with(IndexOperation::put(key("k"), RecordId::new(1, 40)));

    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, original_tags());
    assert_eq!(tags.value_encoding(&key("k")).unwrap(), Some(ValueEncoding::External));
}

#[test]
fn test_failed_commit_keeps_removed_external_key() {
    let fixture = Fixture::with_external_sets(external_config());
    let tags = fixture.indexes.get("tags").unwrap();

    fixture.fail_commit_with(IndexOperation::remove(key("k"), None));

    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, original_tags());
    assert_eq!(tags.size().unwrap(), 1);
}

#[test]
fn test_failed_commit_keeps_external_set_after_entry_removal() {
    let fixture = Fixture::with_external_sets(external_config());
    let tags = fixture.indexes.get("tags").unwrap();

    fixture.fail_commit_with(IndexOperation::remove(key("k"), Some(RecordId::new(1, 1))));

    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, original_tags());
}

#[test]
fn test_failed_commit_keeps_cleared_external_index() {
    let fixture = Fixture::with_external_sets(external_config());
    let tags = fixture.indexes.get("tags").unwrap();

    let mut tx = begun(7);
    tx.clear_index(fixture.ctx(), "tags").unwrap();
    tx.add_index_entry(fixture.ctx(), "unique_tags", IndexOperation::put(key("taken"), RecordId::new(1, 10)))
        .unwrap();
    assert!(tx.commit(fixture.ctx()).is_err());

    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, original_tags());
}

#[test]
fn test_failed_commit_is_not_auto_saved() {
    let config = Config::builder()
        .in_memory(true)
        .rid_binary_threshold(2)
        .max_updates_before_save(1)
        .watchdog_enabled(false)
        .build();
    let fixture = Fixture::with_external_sets(config);
    let tags = fixture.indexes.get("tags").unwrap();

    let mut tx = begun(7);
    tx.add_index_entry(fixture.ctx(), "tags", IndexOperation::put(key("fresh"), RecordId::new(1, 40)))
        .unwrap();
    tx.add_index_entry(fixture.ctx(), "tags", IndexOperation::put(key("k"), RecordId::new(1, 41)))
        .unwrap();
    tx.add_index_entry(fixture.ctx(), "unique_tags", IndexOperation::put(key("taken"), RecordId::new(1, 10)))
        .unwrap();
    assert!(tx.commit(fixture.ctx()).is_err());

    assert!(!tags.contains(&key("fresh")).unwrap());
    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, original_tags());
    assert_eq!(tags.size().unwrap(), 1);
}

#[test]
fn test_commit_after_failed_commit_succeeds() {
    let fixture = Fixture::with_external_sets(external_config());
    let tags = fixture.indexes.get("tags").unwrap();
    fixture.fail_commit_with(IndexOperation::put(key("k"), RecordId::new(1, 40)));

    let mut tx = begun(8);
    tx.add_index_entry(fixture.ctx(), "tags", IndexOperation::put(key("k"), RecordId::new(1, 41)))
        .unwrap();
    tx.add_index_entry(fixture.ctx(), "tags", IndexOperation::remove(key("k"), Some(RecordId::new(1, 0))))
        .unwrap();
    tx.commit(fixture.ctx()).unwrap();

    let rids: Vec<RecordId> = tags.get(&key("k")).unwrap().into_iter().collect();
    assert_eq!(rids, vec![RecordId::new(1, 1), RecordId::new(1, 2), RecordId::new(1, 41)]);

    // The reloaded state is the flushed one
    tags.unload().unwrap();
    assert_eq!(tags.get(&key("k")).unwrap().len(), 3);
}

#[test]
fn test_no_tx_failed_batch_is_dropped() {
    let fixture = Fixture::with_external_sets(external_config());
    let unique = fixture.indexes.get("unique_tags").unwrap();
    let mut tx = NoTx::new(1);

    let result = tx.add_index_entry(fixture.ctx(), "unique_tags", IndexOperation::put(key("taken"), RecordId::new(1, 10)));

    assert!(matches!(result, Err(AtlasError::DuplicateKey { .. })));
    assert_eq!(unique.get(&key("taken")).unwrap().len(), 1);
    assert!(unique.get(&key("taken")).unwrap().contains(&RecordId::new(1, 9)));
}

// =============================================================================
// ActiveTransaction Tests
// =============================================================================

#[test]
fn test_active_transaction_delegates() {
    let fixture = Fixture::new();

    let mut active = ActiveTransaction::NoTx(NoTx::new(3));
    assert_eq!(active.mode(), TxMode::NoTx);
    assert_eq!(active.id(), 3);
    assert!(active.as_optimistic().is_none());

    active = ActiveTransaction::Optimistic(begun(4));
    assert_eq!(active.mode(), TxMode::Optimistic);
    assert_eq!(active.id(), 4);

    let id = active.save(fixture.ctx(), &mut person("Tom"), None).unwrap();
    assert!(id.is_temporary());
    assert_eq!(active.as_optimistic().unwrap().record_entries_by_class(None).len(), 1);

    active.rollback(fixture.ctx()).unwrap();
    assert!(fixture.records.load(id).unwrap().is_none());
}
