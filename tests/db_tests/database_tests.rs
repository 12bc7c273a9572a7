//! Tests for Database
//!
//! These tests verify:
//! - NO_TX / OPTIMISTIC transitions, including after failures
//! - Automatic index maintenance on save, update and delete
//! - Listener failures never reach the caller
//! - The record cache is invalidated when a commit fails
//! - Indexes and their content survive a reopen

use std::sync::Arc;

use atlasdoc::db::DatabaseListener;
use atlasdoc::index::{IndexDefinition, IndexKey, IndexKind};
use atlasdoc::record::{MemoryRecordStore, Record, RecordId};
use atlasdoc::tx::{IndexOperation, TxMode};
use atlasdoc::{AtlasError, Config, Database, Result};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_in_memory() -> Database {
    let config = Config::builder().in_memory(true).watchdog_enabled(false).build();
    Database::open(config).unwrap()
}

fn by_name(kind: IndexKind) -> IndexDefinition {
    IndexDefinition::new("by_name", kind)
        .automatic(true)
        .on_container("Person")
        .field("name")
}

fn person(name: &str) -> Record {
    Record::new("Person").with_field("name", name)
}

fn key(name: &str) -> IndexKey {
    IndexKey::from(name)
}

/// Listener recording every event it sees, failing on all of them
#[derive(Default)]
struct FailingListener {
    events: Mutex<Vec<String>>,
}

impl FailingListener {
    fn record(&self, event: &str, tx: u64) -> Result<()> {
        self.events.lock().push(format!("{} {}", event, tx));
        Err(AtlasError::Listener(format!("{} refused", event)))
    }
}

impl DatabaseListener for FailingListener {
    fn on_before_tx_begin(&self, tx: u64) -> Result<()> {
        self.record("before_begin", tx)
    }

    fn on_after_tx_begin(&self, tx: u64) -> Result<()> {
        self.record("after_begin", tx)
    }

    fn on_before_tx_commit(&self, tx: u64) -> Result<()> {
        self.record("before_commit", tx)
    }

    fn on_after_tx_commit(&self, tx: u64) -> Result<()> {
        self.record("after_commit", tx)
    }

    fn on_before_tx_rollback(&self, tx: u64) -> Result<()> {
        self.record("before_rollback", tx)
    }

    fn on_after_tx_rollback(&self, tx: u64) -> Result<()> {
        self.record("after_rollback", tx)
    }
}

// =============================================================================
// Transaction State Tests
// =============================================================================

#[test]
fn test_starts_in_no_tx() {
    let db = open_in_memory();
    assert_eq!(db.tx_mode(), TxMode::NoTx);
    assert!(db.with_transaction(|_| ()).is_none());
}

#[test]
fn test_begin_commit_returns_to_no_tx() {
    let db = open_in_memory();

    let id = db.begin().unwrap();
    assert_eq!(db.tx_mode(), TxMode::Optimistic);
    assert_eq!(db.current_tx_id(), id);

    db.commit().unwrap();
    assert_eq!(db.tx_mode(), TxMode::NoTx);
    assert_ne!(db.current_tx_id(), id);
}

#[test]
fn test_begin_twice_rolls_back_first() {
    let db = open_in_memory();

    let first = db.begin().unwrap();
    let temp = db.save(&mut person("Tom")).unwrap();
    let second = db.begin().unwrap();

    assert_ne!(first, second);
    assert_eq!(db.tx_mode(), TxMode::Optimistic);
    assert!(db.load(temp).unwrap().is_none());
    assert_eq!(db.with_transaction(|tx| tx.record_entries_by_class(None).len()), Some(0));
}

#[test]
fn test_rollback_discards_records() {
    let db = open_in_memory();
    db.begin().unwrap();
    let temp = db.save(&mut person("Tom")).unwrap();
    assert!(db.load(temp).unwrap().is_some());

    db.rollback().unwrap();

    assert_eq!(db.tx_mode(), TxMode::NoTx);
    assert!(db.load(temp).unwrap().is_none());
}

#[test]
fn test_failed_commit_resets_to_no_tx() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::Unique)).unwrap();
    db.save(&mut person("Tom")).unwrap();

    db.begin().unwrap();
    db.save(&mut person("Tom")).unwrap();
    let result = db.commit();

    assert!(matches!(result, Err(AtlasError::DuplicateKey { .. })));
    assert_eq!(db.tx_mode(), TxMode::NoTx);
    assert_eq!(db.indexes().get("by_name").unwrap().size().unwrap(), 1);
}

#[test]
fn test_failed_commit_clears_record_cache() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::Unique)).unwrap();
    let tom = db.save(&mut person("Tom")).unwrap();
    db.load(tom).unwrap();
    assert!(!db.record_cache().is_empty());

    db.begin().unwrap();
    db.save(&mut person("Tom")).unwrap();
    assert!(db.commit().is_err());

    assert!(db.record_cache().is_empty());
}

// =============================================================================
// Automatic Index Tests
// =============================================================================

#[test]
fn test_save_maintains_automatic_index() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::NotUnique)).unwrap();

    let id = db.save(&mut person("Tom")).unwrap();

    let index = db.indexes().get("by_name").unwrap();
    assert!(index.get(&key("Tom")).unwrap().contains(&id));
}

#[test]
fn test_update_moves_index_entry() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::NotUnique)).unwrap();
    let mut record = person("Tom");
    let id = db.save(&mut record).unwrap();

    record.set_field("name", "Thomas");
    db.save(&mut record).unwrap();

    let index = db.indexes().get("by_name").unwrap();
    assert!(index.get(&key("Tom")).unwrap().is_empty());
    assert!(index.get(&key("Thomas")).unwrap().contains(&id));
    assert_eq!(index.size().unwrap(), 1);
}

#[test]
fn test_delete_removes_index_entry() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::NotUnique)).unwrap();
    let id = db.save(&mut person("Tom")).unwrap();

    assert!(db.delete(id).unwrap());
    assert!(!db.delete(id).unwrap());

    let index = db.indexes().get("by_name").unwrap();
    assert_eq!(index.size().unwrap(), 0);
    assert!(db.load(id).unwrap().is_none());
}

#[test]
fn test_manual_index_is_not_maintained() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::NotUnique).automatic(false)).unwrap();

    db.save(&mut person("Tom")).unwrap();

    assert_eq!(db.indexes().get("by_name").unwrap().size().unwrap(), 0);
}

#[test]
fn test_create_index_builds_from_existing_records() {
    let db = open_in_memory();
    let tom = db.save(&mut person("Tom")).unwrap();
    db.save(&mut Record::new("Pet").with_field("name", "Rex")).unwrap();

    let index = db.create_index(by_name(IndexKind::NotUnique)).unwrap();

    assert_eq!(index.size().unwrap(), 1);
    assert!(index.get(&key("Tom")).unwrap().contains(&tom));
}

#[test]
fn test_transaction_remaps_index_entries() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::NotUnique)).unwrap();

    db.begin().unwrap();
    let temp = db.save(&mut person("Meg")).unwrap();
    assert!(temp.is_temporary());

    // Buffered, not applied
    let index = db.indexes().get("by_name").unwrap();
    assert!(index.get(&key("Meg")).unwrap().is_empty());
    db.commit().unwrap();

    let rids = index.get(&key("Meg")).unwrap();
    assert_eq!(rids.len(), 1);
    let persisted = *rids.iter().next().unwrap();
    assert!(!persisted.is_temporary());
    assert_eq!(db.load(persisted).unwrap().unwrap().field("name"), Some(&serde_json::json!("Meg")));
}

#[test]
fn test_manual_index_entries_through_transaction() {
    let db = open_in_memory();
    db.create_index(IndexDefinition::new("tags", IndexKind::NotUnique)).unwrap();
    let rid = RecordId::new(1, 0);

    db.begin().unwrap();
    db.add_index_entry("tags", IndexOperation::put(key("red"), rid)).unwrap();
    db.add_index_entry("tags", IndexOperation::put(key("blue"), rid)).unwrap();
    db.commit().unwrap();

    let index = db.indexes().get("tags").unwrap();
    assert_eq!(index.size().unwrap(), 2);

    db.clear_index("tags").unwrap();
    assert_eq!(index.size().unwrap(), 0);
}

#[test]
fn test_custom_extractor() {
    let db = open_in_memory();
    let definition = IndexDefinition::new("by_initial", IndexKind::NotUnique)
        .automatic(true)
        .on_container("Person");
    let extractor = |record: &Record| -> Result<Option<IndexKey>> {
        Ok(record
            .field("name")
            .and_then(|v| v.as_str())
            .and_then(|name| name.chars().next())
            .map(|c| IndexKey::from(c.to_string())))
    };
    db.create_index_with_extractor(definition, Arc::new(extractor)).unwrap();

    db.save(&mut person("Tom")).unwrap();
    db.save(&mut person("Tim")).unwrap();

    let index = db.indexes().get("by_initial").unwrap();
    assert_eq!(index.get(&key("T")).unwrap().len(), 2);
}

// =============================================================================
// Listener Tests
// =============================================================================

#[test]
fn test_listener_errors_are_swallowed() {
    let db = open_in_memory();
    let listener = Arc::new(FailingListener::default());
    db.add_listener(listener.clone());

    let id = db.begin().unwrap();
    db.commit().unwrap();
    let second = db.begin().unwrap();
    db.rollback().unwrap();

    let events = listener.events.lock().clone();
    assert_eq!(
        events,
        vec![
            format!("before_begin {}", id),
            format!("after_begin {}", id),
            format!("before_commit {}", id),
            format!("after_commit {}", id),
            format!("before_begin {}", second),
            format!("after_begin {}", second),
            format!("before_rollback {}", second),
            format!("after_rollback {}", second),
        ]
    );
}

#[test]
fn test_after_commit_not_called_on_failure() {
    let db = open_in_memory();
    db.create_index(by_name(IndexKind::Unique)).unwrap();
    db.save(&mut person("Tom")).unwrap();
    let listener = Arc::new(FailingListener::default());
    db.add_listener(listener.clone());

    let id = db.begin().unwrap();
    db.save(&mut person("Tom")).unwrap();
    assert!(db.commit().is_err());

    let events = listener.events.lock().clone();
    assert!(events.contains(&format!("before_commit {}", id)));
    assert!(!events.contains(&format!("after_commit {}", id)));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_keeps_index_content() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .watchdog_enabled(false)
        .build();
    let records = Arc::new(MemoryRecordStore::new());

    let tom = {
        let db = Database::open_with(config.clone(), records.clone(), Default::default()).unwrap();
        db.create_index(by_name(IndexKind::NotUnique)).unwrap();
        let tom = db.save(&mut person("Tom")).unwrap();
        db.close().unwrap();
        tom
    };

    let db = Database::open_with(config, records, Default::default()).unwrap();
    let index = db.indexes().get("by_name").unwrap();
    assert!(index.get(&key("Tom")).unwrap().contains(&tom));

    // Automatic maintenance resumes after the reopen
    let meg = db.save(&mut person("Meg")).unwrap();
    assert!(index.get(&key("Meg")).unwrap().contains(&meg));
}

#[test]
fn test_close_rolls_back_open_transaction() {
    let db = open_in_memory();
    db.begin().unwrap();
    db.save(&mut person("Tom")).unwrap();

    db.close().unwrap();

    assert_eq!(db.tx_mode(), TxMode::NoTx);
    assert_eq!(db.records().count_elements("Person").unwrap(), 0);
}
