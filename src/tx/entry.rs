//! Buffered transaction entries

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::IndexKey;
use crate::record::{Record, RecordId};

/// Kind of a buffered index operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexOpStatus {
    Put,
    Remove,
}

/// Key targeted by an index operation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationKey {
    Key(IndexKey),
    /// Every key of the index
    Wildcard,
}

impl OperationKey {
    /// Token used as the key of a commit batch document
    ///
    /// `"*"` for the wildcard, the JSON encoding of the key otherwise.
    pub fn token(&self) -> Result<String> {
        match self {
            OperationKey::Wildcard => Ok("*".to_string()),
            OperationKey::Key(key) => Ok(serde_json::to_string(key)?),
        }
    }

    pub fn from_token(token: &str) -> Result<Self> {
        if token == "*" {
            return Ok(OperationKey::Wildcard);
        }
        Ok(OperationKey::Key(serde_json::from_str(token)?))
    }
}

impl From<IndexKey> for OperationKey {
    fn from(key: IndexKey) -> Self {
        OperationKey::Key(key)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKey::Key(key) => write!(f, "{}", key),
            OperationKey::Wildcard => f.write_str("*"),
        }
    }
}

/// One buffered index mutation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOperation {
    pub status: IndexOpStatus,
    pub key: OperationKey,
    /// `None` with `Remove` removes the whole key
    pub value: Option<RecordId>,
}

impl IndexOperation {
    pub fn put(key: IndexKey, rid: RecordId) -> Self {
        Self {
            status: IndexOpStatus::Put,
            key: OperationKey::Key(key),
            value: Some(rid),
        }
    }

    pub fn remove(key: IndexKey, rid: Option<RecordId>) -> Self {
        Self {
            status: IndexOpStatus::Remove,
            key: OperationKey::Key(key),
            value: rid,
        }
    }

    /// Remove `rid` from every key
    pub fn remove_everywhere(rid: RecordId) -> Self {
        Self {
            status: IndexOpStatus::Remove,
            key: OperationKey::Wildcard,
            value: Some(rid),
        }
    }
}

/// What a buffered record entry does at commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Created,
    Updated,
    Deleted,
}

/// A buffered record mutation; the last write for an identity wins
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub status: RecordStatus,
    pub record: Record,
    pub container_hint: Option<String>,
}

impl RecordEntry {
    /// Identity of the record (temporary for created records)
    pub fn id(&self) -> Option<RecordId> {
        self.record.id
    }
}
