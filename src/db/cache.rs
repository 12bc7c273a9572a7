//! Cache of persisted records

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::record::{Record, RecordId};

/// Records as last seen in the record store
///
/// Only persisted state goes in; buffered transaction changes never do.
#[derive(Default)]
pub struct RecordCache {
    records: Mutex<HashMap<RecordId, Record>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.records.lock().get(&id).cloned()
    }

    pub fn put(&self, record: &Record) {
        if let Some(id) = record.id {
            self.records.lock().insert(id, record.clone());
        }
    }

    pub fn remove(&self, id: RecordId) {
        self.records.lock().remove(&id);
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
