//! Tree nodes and their persisted images

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::storage::NodeId;

/// Directory entry of the root: one per leaf
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeafRef<K> {
    /// Smallest key stored in the leaf
    pub low: K,
    pub id: NodeId,
    pub len: usize,
}

/// Root node: authoritative size plus the ordered leaf directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RootNode<K> {
    pub size: u64,
    pub leaves: Vec<LeafRef<K>>,
}

impl<K: Ord> RootNode<K> {
    pub fn empty() -> Self {
        Self {
            size: 0,
            leaves: Vec::new(),
        }
    }

    /// Index of the leaf that holds (or would hold) `key`
    pub fn locate(&self, key: &K) -> Option<usize> {
        if self.leaves.is_empty() {
            return None;
        }
        let idx = self.leaves.partition_point(|l| l.low <= *key);
        Some(idx.saturating_sub(1))
    }
}

/// Leaf node: sorted entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeafNode<K, V> {
    pub entries: Vec<(K, V)>,
}

impl<K: Ord, V> LeafNode<K, V> {
    pub fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }
}

/// On-disk image of any node
#[derive(Deserialize)]
enum StoredNode<K, V> {
    Root(RootNode<K>),
    Leaf(LeafNode<K, V>),
}

/// Borrowed twin of `StoredNode` so writes don't clone the node
#[derive(Serialize)]
enum StoredNodeRef<'a, K, V> {
    Root(&'a RootNode<K>),
    Leaf(&'a LeafNode<K, V>),
}

pub(crate) fn encode_root<K: Serialize, V: Serialize>(root: &RootNode<K>) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&StoredNodeRef::<K, V>::Root(root))?)
}

pub(crate) fn encode_leaf<K: Serialize, V: Serialize>(leaf: &LeafNode<K, V>) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&StoredNodeRef::Leaf(leaf))?)
}

pub(crate) fn decode_root<K, V>(id: NodeId, bytes: &[u8]) -> Result<RootNode<K>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    match decode::<K, V>(id, bytes)? {
        StoredNode::Root(root) => Ok(root),
        StoredNode::Leaf(_) => Err(AtlasError::Persistence(format!(
            "{} is a leaf, expected a root",
            id
        ))),
    }
}

pub(crate) fn decode_leaf<K, V>(id: NodeId, bytes: &[u8]) -> Result<LeafNode<K, V>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    match decode::<K, V>(id, bytes)? {
        StoredNode::Leaf(leaf) => Ok(leaf),
        StoredNode::Root(_) => Err(AtlasError::Persistence(format!(
            "{} is a root, expected a leaf",
            id
        ))),
    }
}

fn decode<K, V>(id: NodeId, bytes: &[u8]) -> Result<StoredNode<K, V>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    bincode::deserialize(bytes)
        .map_err(|e| AtlasError::Persistence(format!("Cannot decode {}: {}", id, e)))
}
