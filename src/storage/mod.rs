//! Storage Module
//!
//! Persistent containers for tree nodes.
//!
//! ## Responsibilities
//! - Hand out stable, never-reused node identifiers
//! - Persist and load opaque node images
//! - Detect torn or corrupted node images (CRC32)
//! - Provide a durability barrier for commits
//!
//! ## Node File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                          │
//! │ ┌──────────┬───────────┬──────────────┬──────────────────┐ │
//! │ │Magic (4) │Version (2)│ PayloadLen(4)│   CRC32 (4)      │ │
//! │ └──────────┴───────────┴──────────────┴──────────────────┘ │
//! ├────────────────────────────────────────────────────────────┤
//! │ Payload (bincode node image)                               │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod file;
mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::FileNodeStore;
pub use memory::MemoryNodeStore;

/// Stable identifier of a persisted node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// A container of node images
///
/// One store is owned by exactly one index; nested RID-set trees of that
/// index share it.
pub trait NodeStore: Send + Sync {
    /// Reserve a fresh node id
    fn allocate(&self) -> Result<NodeId>;

    /// Persist (or overwrite) a node image
    fn write(&self, id: NodeId, bytes: &[u8]) -> Result<()>;

    /// Load a node image; a missing or corrupt node is a persistence error
    fn read(&self, id: NodeId) -> Result<Vec<u8>>;

    /// Remove a node; removing a missing node is not an error
    fn delete(&self, id: NodeId) -> Result<()>;

    /// Make every completed write durable
    fn sync(&self) -> Result<()>;

    /// Whether a node image exists
    fn contains(&self, id: NodeId) -> bool;

    /// Number of stored node images
    fn node_count(&self) -> usize;
}
