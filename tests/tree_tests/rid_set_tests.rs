//! Tests for RidSet
//!
//! These tests verify:
//! - Embedded sets move to an external tree past the binary threshold
//! - External sets stay external after shrinking
//! - A threshold of 0 keeps every set embedded
//! - Releasing an external set deletes its nested tree
//! - Detached copies leave the original nested tree untouched
//! - Retired sets survive an unload; staged sets do not survive it

use std::sync::Arc;

use atlasdoc::record::RecordId;
use atlasdoc::storage::{MemoryNodeStore, NodeStore};
use atlasdoc::tree::{PersistentTreeMap, RidSet, RidSetContext, TreeSettings, TreeValue, ValueEncoding};

// =============================================================================
// Helper Functions
// =============================================================================

fn rid_settings() -> TreeSettings {
    TreeSettings {
        page_size: 4,
        max_updates_before_save: 0,
        optimize_threshold: 0,
    }
}

fn context(store: &Arc<dyn NodeStore>, threshold: usize) -> RidSetContext {
    RidSetContext {
        store: Arc::clone(store),
        binary_threshold: threshold,
        settings: rid_settings(),
    }
}

fn rid(position: i64) -> RecordId {
    RecordId::new(1, position)
}

// =============================================================================
// Embedded Tests
// =============================================================================

#[test]
fn test_embedded_insert_remove() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 8);
    let mut set = RidSet::default();

    assert!(set.insert(&ctx, rid(1)).unwrap());
    assert!(!set.insert(&ctx, rid(1)).unwrap());
    assert!(set.insert(&ctx, rid(2)).unwrap());

    assert_eq!(set.len(), 2);
    assert_eq!(set.encoding(), ValueEncoding::Embedded);
    assert!(set.contains(&ctx, &rid(2)).unwrap());

    assert!(set.remove(&ctx, &rid(1)).unwrap());
    assert!(!set.remove(&ctx, &rid(1)).unwrap());
    assert_eq!(set.len(), 1);

    // Embedded sets never touch the store
    assert_eq!(store.node_count(), 0);
}

#[test]
fn test_zero_threshold_never_externalizes() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 0);
    let mut set = RidSet::default();

    for i in 0..100 {
        set.insert(&ctx, rid(i)).unwrap();
    }

    assert!(!set.is_external());
    assert_eq!(set.len(), 100);
}

#[test]
fn test_replace_with_keeps_one() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 8);
    let mut set = RidSet::single(rid(1));
    set.insert(&ctx, rid(2)).unwrap();

    set.replace_with(&ctx, rid(9)).unwrap();

    assert_eq!(set.to_set(&ctx).unwrap().into_iter().collect::<Vec<_>>(), vec![rid(9)]);
}

// =============================================================================
// External Tests
// =============================================================================

#[test]
fn test_switches_past_threshold() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 3);
    let mut set = RidSet::default();

    for i in 0..3 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    assert_eq!(set.encoding(), ValueEncoding::Embedded);

    set.insert(&ctx, rid(3)).unwrap();
    assert_eq!(set.encoding(), ValueEncoding::External);
    assert_eq!(set.len(), 4);
    assert!(store.node_count() > 0);

    let members: Vec<RecordId> = set.to_set(&ctx).unwrap().into_iter().collect();
    assert_eq!(members, (0..4).map(rid).collect::<Vec<_>>());
}

#[test]
fn test_external_stays_external_after_removals() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut set = RidSet::default();
    for i in 0..5 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    assert!(set.is_external());

    for i in 0..4 {
        assert!(set.remove(&ctx, &rid(i)).unwrap());
    }

    assert!(set.is_external());
    assert_eq!(set.len(), 1);
    assert!(set.contains(&ctx, &rid(4)).unwrap());
    assert!(!set.contains(&ctx, &rid(0)).unwrap());
}

#[test]
fn test_external_duplicate_insert() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 1);
    let mut set = RidSet::default();
    set.insert(&ctx, rid(0)).unwrap();
    set.insert(&ctx, rid(1)).unwrap();
    assert!(set.is_external());

    assert!(!set.insert(&ctx, rid(1)).unwrap());
    assert_eq!(set.len(), 2);
}

#[test]
fn test_release_deletes_nested_tree() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut set = RidSet::default();
    for i in 0..20 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    assert!(store.node_count() > 1);

    set.release(&store).unwrap();

    assert_eq!(store.node_count(), 0);
}

#[test]
fn test_clearing_a_map_releases_external_values() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);

    let mut map: PersistentTreeMap<i64, RidSet> = PersistentTreeMap::create(Arc::clone(&store), rid_settings()).unwrap();
    let mut set = RidSet::default();
    for i in 0..10 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    map.put(1, set).unwrap();
    map.put(2, RidSet::single(rid(99))).unwrap();
    map.commit_changes().unwrap();

    map.clear().unwrap();
    map.commit_changes().unwrap();

    // Only the outer root is left
    assert_eq!(store.node_count(), 1);
}

#[test]
fn test_detach_leaves_original_untouched() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut original = RidSet::default();
    for i in 0..5 {
        original.insert(&ctx, rid(i)).unwrap();
    }

    let mut copy = original.detach(&ctx).unwrap();
    copy.insert(&ctx, rid(50)).unwrap();
    copy.remove(&ctx, &rid(0)).unwrap();

    assert_ne!(copy.owned_root(), original.owned_root());
    assert_eq!(original.to_set(&ctx).unwrap().len(), 5);
    assert!(original.contains(&ctx, &rid(0)).unwrap());
    assert!(!original.contains(&ctx, &rid(50)).unwrap());
    assert_eq!(copy.len(), 5);
    assert!(copy.contains(&ctx, &rid(50)).unwrap());
}

#[test]
fn test_retired_set_survives_unload() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut map: PersistentTreeMap<i64, RidSet> = PersistentTreeMap::create(Arc::clone(&store), rid_settings()).unwrap();
    let mut set = RidSet::default();
    for i in 0..10 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    map.put(1, set).unwrap();
    map.commit_changes().unwrap();

    let removed = map.remove(&1).unwrap().unwrap();
    map.retire(removed).unwrap();
    map.unload().unwrap();

    let restored = map.get(&1).unwrap().unwrap();
    assert_eq!(restored.to_set(&ctx).unwrap().len(), 10);
}

#[test]
fn test_retired_set_released_after_flush() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut map: PersistentTreeMap<i64, RidSet> = PersistentTreeMap::create(Arc::clone(&store), rid_settings()).unwrap();
    let mut set = RidSet::default();
    for i in 0..10 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    map.put(1, set).unwrap();
    map.commit_changes().unwrap();

    let removed = map.remove(&1).unwrap().unwrap();
    map.retire(removed.clone()).unwrap();
    assert!(store.contains(removed.owned_root().unwrap()));

    map.commit_changes().unwrap();

    assert!(!store.contains(removed.owned_root().unwrap()));
    assert_eq!(store.node_count(), 1);
}

#[test]
fn test_unload_releases_staged_set() {
    let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::new());
    let ctx = context(&store, 2);
    let mut map: PersistentTreeMap<i64, RidSet> = PersistentTreeMap::create(Arc::clone(&store), rid_settings()).unwrap();
    map.commit_changes().unwrap();

    let mut set = RidSet::default();
    for i in 0..10 {
        set.insert(&ctx, rid(i)).unwrap();
    }
    map.stage(&set);
    assert!(map.is_staged(set.owned_root().unwrap()));
    map.put(1, set).unwrap();

    map.unload().unwrap();

    assert!(map.get(&1).unwrap().is_none());
    assert_eq!(store.node_count(), 1);
}

#[test]
fn test_legible_embedded_encoding() {
    let set = RidSet::Embedded([rid(0), rid(2)].into_iter().collect());

    let json = serde_json::to_string(&set).unwrap();
    assert_eq!(json, r##"{"Embedded":"[#1:0,#1:2]"}"##);

    let back: RidSet = serde_json::from_str(&json).unwrap();
    assert_eq!(back, set);
}
