//! Range cursor over a `PersistentTreeMap`

use std::collections::{HashSet, VecDeque};
use std::ops::Bound;

use crate::error::Result;
use crate::storage::NodeId;

use super::cache::PinTable;
use super::map::PersistentTreeMap;
use super::{TreeKey, TreeValue};

/// Lazily advancing scan over a key range
///
/// The cursor does not borrow the map: each step takes the map by reference
/// and re-seeks from the last key it returned, so the owner may release its
/// lock between steps. Leaves the cursor has visited stay pinned (and are
/// skipped by eviction) until the cursor is exhausted, closed or dropped.
pub struct Cursor<K, V> {
    lower: Bound<K>,
    upper: Bound<K>,
    buffer: VecDeque<(K, V)>,
    pinned: HashSet<NodeId>,
    pins: PinTable,
    exhausted: bool,
}

impl<K: TreeKey, V: TreeValue> Cursor<K, V> {
    pub(crate) fn new(lower: Bound<K>, upper: Bound<K>, pins: PinTable) -> Self {
        Self {
            lower,
            upper,
            buffer: VecDeque::new(),
            pinned: HashSet::new(),
            pins,
            exhausted: false,
        }
    }

    /// Next entry in key order, or `None` once the range is exhausted
    pub fn next_entry(&mut self, map: &PersistentTreeMap<K, V>) -> Result<Option<(K, V)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill(map)?;
        }

        match self.buffer.pop_front() {
            Some(entry) => Ok(Some(entry)),
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    /// Release every pinned leaf; further steps return `None`
    pub fn close(&mut self) {
        self.exhausted = true;
        self.buffer.clear();
        for id in self.pinned.drain() {
            self.pins.unpin(id);
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Leaves currently pinned by this cursor
    pub fn pinned_nodes(&self) -> usize {
        self.pinned.len()
    }

    fn fill(&mut self, map: &PersistentTreeMap<K, V>) -> Result<()> {
        let Some(mut idx) = map.seek(&self.lower) else {
            self.exhausted = true;
            return Ok(());
        };

        while let Some(id) = map.leaf_id(idx) {
            if self.pinned.insert(id) {
                self.pins.pin(id);
            }

            let (entries, passed_upper) = map.scan_leaf(id, &self.lower, &self.upper)?;
            if let Some((last, _)) = entries.last() {
                self.lower = Bound::Excluded(last.clone());
            }
            self.buffer.extend(entries);

            if passed_upper {
                self.exhausted = true;
                return Ok(());
            }
            if !self.buffer.is_empty() {
                return Ok(());
            }
            idx += 1;
        }

        self.exhausted = true;
        Ok(())
    }
}

impl<K, V> Drop for Cursor<K, V> {
    fn drop(&mut self) {
        for id in self.pinned.drain() {
            self.pins.unpin(id);
        }
    }
}
