//! Record-identifier sets stored as index values

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::RecordId;
use crate::storage::{NodeId, NodeStore};

use super::map::PersistentTreeMap;
use super::{TreeSettings, TreeValue};

/// Encoding of a `RidSet` inside its leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueEncoding {
    Embedded,
    External,
}

/// Everything a `RidSet` needs to reach its nested tree
#[derive(Clone)]
pub struct RidSetContext {
    pub store: Arc<dyn NodeStore>,

    /// Element count above which an embedded set moves out (0 = never)
    pub binary_threshold: usize,

    pub settings: TreeSettings,
}

/// Set of record identifiers attached to one index key
///
/// Small sets are embedded in the leaf as a legible string such as
/// `"[#1:0,#1:2]"`. Once a set grows past the binary threshold it moves to
/// its own `PersistentTreeMap<RecordId, ()>` in the same node store and
/// stays there, even if it later shrinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RidSet {
    Embedded(#[serde(with = "legible")] BTreeSet<RecordId>),
    External { root: NodeId, len: u64 },
}

impl Default for RidSet {
    fn default() -> Self {
        RidSet::Embedded(BTreeSet::new())
    }
}

impl RidSet {
    pub fn single(rid: RecordId) -> Self {
        RidSet::Embedded(BTreeSet::from([rid]))
    }

    pub fn len(&self) -> u64 {
        match self {
            RidSet::Embedded(set) => set.len() as u64,
            RidSet::External { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_external(&self) -> bool {
        matches!(self, RidSet::External { .. })
    }

    pub fn encoding(&self) -> ValueEncoding {
        match self {
            RidSet::Embedded(_) => ValueEncoding::Embedded,
            RidSet::External { .. } => ValueEncoding::External,
        }
    }

    /// Add an identifier; returns `false` if it was already present
    pub fn insert(&mut self, ctx: &RidSetContext, rid: RecordId) -> Result<bool> {
        match self {
            RidSet::Embedded(set) => {
                if !set.insert(rid) {
                    return Ok(false);
                }
                if ctx.binary_threshold > 0 && set.len() > ctx.binary_threshold {
                    let moved = std::mem::take(set);
                    *self = Self::externalize(ctx, moved)?;
                }
                Ok(true)
            }
            RidSet::External { root, len } => {
                let mut tree = Self::open_tree(ctx, *root)?;
                let inserted = tree.put(rid, ())?.is_none();
                tree.lazy_save()?;
                if inserted {
                    *len += 1;
                }
                Ok(inserted)
            }
        }
    }

    /// Remove an identifier; returns `false` if it was absent
    ///
    /// An external set stays external after removals.
    pub fn remove(&mut self, ctx: &RidSetContext, rid: &RecordId) -> Result<bool> {
        match self {
            RidSet::Embedded(set) => Ok(set.remove(rid)),
            RidSet::External { root, len } => {
                let mut tree = Self::open_tree(ctx, *root)?;
                let removed = tree.remove(rid)?.is_some();
                tree.lazy_save()?;
                if removed {
                    *len -= 1;
                }
                Ok(removed)
            }
        }
    }

    pub fn contains(&self, ctx: &RidSetContext, rid: &RecordId) -> Result<bool> {
        match self {
            RidSet::Embedded(set) => Ok(set.contains(rid)),
            RidSet::External { root, .. } => Self::open_tree(ctx, *root)?.contains_key(rid),
        }
    }

    /// Materialize the identifiers in order
    pub fn to_set(&self, ctx: &RidSetContext) -> Result<BTreeSet<RecordId>> {
        match self {
            RidSet::Embedded(set) => Ok(set.clone()),
            RidSet::External { root, .. } => {
                let tree = Self::open_tree(ctx, *root)?;
                let mut cursor = tree.cursor(Bound::Unbounded, Bound::Unbounded);
                let mut out = BTreeSet::new();
                while let Some((rid, ())) = cursor.next_entry(&tree)? {
                    out.insert(rid);
                }
                Ok(out)
            }
        }
    }

    /// Replace the content with a single identifier, keeping the encoding
    pub fn replace_with(&mut self, ctx: &RidSetContext, rid: RecordId) -> Result<()> {
        match self {
            RidSet::Embedded(set) => {
                set.clear();
                set.insert(rid);
            }
            RidSet::External { root, len } => {
                let mut tree = Self::open_tree(ctx, *root)?;
                tree.clear()?;
                tree.put(rid, ())?;
                tree.lazy_save()?;
                *len = 1;
            }
        }
        Ok(())
    }

    /// Copy of the set whose external form lives in a new nested tree
    ///
    /// An embedded set is simply cloned.
    pub fn detach(&self, ctx: &RidSetContext) -> Result<Self> {
        match self {
            RidSet::Embedded(_) => Ok(self.clone()),
            RidSet::External { .. } => Self::externalize(ctx, self.to_set(ctx)?),
        }
    }

    fn externalize(ctx: &RidSetContext, rids: BTreeSet<RecordId>) -> Result<Self> {
        let mut tree = PersistentTreeMap::<RecordId, ()>::create(Arc::clone(&ctx.store), ctx.settings)?;
        for rid in &rids {
            tree.put(*rid, ())?;
        }
        tree.lazy_save()?;

        tracing::debug!(
            "Moved set of {} identifiers to external tree {}",
            rids.len(),
            tree.root_id()
        );

        Ok(RidSet::External {
            root: tree.root_id(),
            len: rids.len() as u64,
        })
    }

    fn open_tree(ctx: &RidSetContext, root: NodeId) -> Result<PersistentTreeMap<RecordId, ()>> {
        PersistentTreeMap::open(Arc::clone(&ctx.store), root, ctx.settings)
    }
}

impl TreeValue for RidSet {
    const NEEDS_RELEASE: bool = true;

    fn owned_root(&self) -> Option<NodeId> {
        match self {
            RidSet::Embedded(_) => None,
            RidSet::External { root, .. } => Some(*root),
        }
    }

    fn release(&self, store: &Arc<dyn NodeStore>) -> Result<()> {
        if let RidSet::External { root, .. } = self {
            let mut tree = PersistentTreeMap::<RecordId, ()>::open(Arc::clone(store), *root, TreeSettings::default())?;
            tree.delete()?;
        }
        Ok(())
    }
}

/// `"[#1:0,#1:2]"` rendering of an embedded set
mod legible {
    use std::collections::BTreeSet;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::record::RecordId;

    pub fn serialize<S: Serializer>(set: &BTreeSet<RecordId>, serializer: S) -> Result<S::Ok, S::Error> {
        let items: Vec<String> = set.iter().map(|rid| rid.to_string()).collect();
        serializer.serialize_str(&format!("[{}]", items.join(",")))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<RecordId>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let inner = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(|| D::Error::custom(format!("malformed identifier set: {}", text)))?;

        inner
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| item.parse::<RecordId>().map_err(D::Error::custom))
            .collect()
    }
}
