//! Tree Module
//!
//! Ordered persistent map with partial memory residency.
//!
//! ## Responsibilities
//! - Ordered key -> value mapping with point lookups and range scans
//! - Nodes individually loadable/savable through a `NodeStore`
//! - Authoritative size kept in the (always resident) root node
//! - Hot set of resident leaves, flushed lazily and evicted on demand
//! - Cursor pinning so eviction never drops a node a live scan is reading
//!
//! ## Node Layout
//! ```text
//!                 ┌───────────────────────────────────┐
//!                 │ Root (always resident)            │
//!                 │ size | [low key, NodeId, len] ... │
//!                 └───────┬───────────┬───────────┬───┘
//!                         │           │           │
//!                  ┌──────▼───┐ ┌─────▼────┐ ┌────▼─────┐
//!                  │  Leaf    │ │  Leaf    │ │  Leaf    │   hot set: NodeId -> leaf
//!                  │ (k,v)... │ │ (k,v)... │ │ (k,v)... │   evicted after flush
//!                  └──────────┘ └──────────┘ └──────────┘
//! ```

mod cache;
mod cursor;
mod map;
mod node;
mod rid_set;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::record::RecordId;
use crate::storage::{NodeId, NodeStore};

pub use cursor::Cursor;
pub use map::PersistentTreeMap;
pub use rid_set::{RidSet, RidSetContext, ValueEncoding};

/// Keys stored in a `PersistentTreeMap`
pub trait TreeKey: Ord + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync {
    /// Whether `self` and `other` may be used together as range bounds
    fn comparable_with(&self, _other: &Self) -> bool {
        true
    }
}

/// Values stored in a `PersistentTreeMap`
pub trait TreeValue: Clone + Serialize + DeserializeOwned + Send + Sync {
    /// Whether `release` does anything; lets `clear` skip loading leaves
    const NEEDS_RELEASE: bool = false;

    /// Free storage owned by the value when its entry is cleared
    fn release(&self, _store: &Arc<dyn NodeStore>) -> Result<()> {
        Ok(())
    }

    /// Root node of the nested storage the value owns, if any
    fn owned_root(&self) -> Option<NodeId> {
        None
    }
}

impl TreeKey for RecordId {}
impl TreeKey for i64 {}
impl TreeKey for u64 {}
impl TreeKey for String {}

impl TreeValue for () {}
impl TreeValue for i64 {}
impl TreeValue for String {}

/// Tuning knobs of a single tree
#[derive(Debug, Clone, Copy)]
pub struct TreeSettings {
    /// Max entries per leaf before it splits
    pub page_size: usize,

    /// Updates between automatic lazy saves (0 disables)
    pub max_updates_before_save: usize,

    /// Resident entries above which a soft optimization runs (0 disables)
    pub optimize_threshold: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            page_size: 256,
            max_updates_before_save: 5000,
            optimize_threshold: 100_000,
        }
    }
}
