//! Commit batches
//!
//! The per-index unit of work handed from a transaction to an index.
//!
//! ## Document Format
//! ```text
//! {
//!   "clear": true,                                   (only when set)
//!   "entries": {
//!     "{\"String\":\"Tom\"}": [ {"status":"PUT","value":"#1:0"},
//!                               {"status":"REMOVE","value":null} ],
//!     "*":                    [ {"status":"REMOVE","value":"#1:3"} ]
//!   }
//! }
//! ```
//! Keys appear in order of first use and each list in buffering order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::{self, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::index::IndexKey;
use crate::record::RecordId;

use super::{IndexOpStatus, IndexOperation, OperationKey};

/// Operation of a batch, without its key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub status: IndexOpStatus,
    #[serde(default, with = "legible_rid")]
    pub value: Option<RecordId>,
}

/// Ordered operation log of one index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Clear the index before replaying the entries
    pub clear: bool,
    entries: Vec<(OperationKey, Vec<BatchOperation>)>,
    positions: BTreeMap<OperationKey, usize>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to its key's list
    pub fn push(&mut self, op: IndexOperation) {
        self.push_raw(
            op.key,
            BatchOperation {
                status: op.status,
                value: op.value,
            },
        );
    }

    /// Drop every buffered operation and mark the batch as clearing
    pub fn clear_all(&mut self) {
        self.clear = true;
        self.entries.clear();
        self.positions.clear();
    }

    /// Keys with their operation lists, in order of first use
    pub fn entries(&self) -> &[(OperationKey, Vec<BatchOperation>)] {
        &self.entries
    }

    /// Operations buffered for `key`
    pub fn operations(&self, key: &OperationKey) -> &[BatchOperation] {
        match self.positions.get(key) {
            Some(&pos) => &self.entries[pos].1,
            None => &[],
        }
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn operation_count(&self) -> usize {
        self.entries.iter().map(|(_, ops)| ops.len()).sum()
    }

    /// Whether committing the batch changes nothing
    pub fn is_empty(&self) -> bool {
        !self.clear && self.entries.is_empty()
    }

    /// Copy with temporary identities replaced by their persisted ones
    pub fn remapped(&self, remap: &HashMap<RecordId, RecordId>) -> Self {
        if remap.is_empty() {
            return self.clone();
        }

        let translate = |rid: RecordId| remap.get(&rid).copied().unwrap_or(rid);
        let mut out = CommitBatch {
            clear: self.clear,
            ..Default::default()
        };
        for (key, ops) in &self.entries {
            let key = match key {
                OperationKey::Key(IndexKey::Link(rid)) => OperationKey::Key(IndexKey::Link(translate(*rid))),
                other => other.clone(),
            };
            for op in ops {
                out.push_raw(
                    key.clone(),
                    BatchOperation {
                        status: op.status,
                        value: op.value.map(translate),
                    },
                );
            }
        }
        out
    }

    /// JSON transport document
    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a transport document, keeping key and operation order
    pub fn from_document(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    fn push_raw(&mut self, key: OperationKey, op: BatchOperation) {
        match self.positions.get(&key) {
            Some(&pos) => self.entries[pos].1.push(op),
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, vec![op]));
            }
        }
    }
}

// =============================================================================
// Document (de)serialization
// =============================================================================

struct EntriesRef<'a>(&'a [(OperationKey, Vec<BatchOperation>)]);

impl Serialize for EntriesRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, ops) in self.0 {
            let token = key.token().map_err(ser::Error::custom)?;
            map.serialize_entry(&token, ops)?;
        }
        map.end()
    }
}

impl Serialize for CommitBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if self.clear {
            map.serialize_entry("clear", &true)?;
        }
        map.serialize_entry("entries", &EntriesRef(&self.entries))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CommitBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(BatchVisitor)
    }
}

struct BatchVisitor;

impl<'de> Visitor<'de> for BatchVisitor {
    type Value = CommitBatch;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a commit batch document")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<CommitBatch, A::Error> {
        let mut batch = CommitBatch::new();
        while let Some(field) = map.next_key::<String>()? {
            match field.as_str() {
                "clear" => batch.clear = map.next_value::<Option<bool>>()?.unwrap_or(false),
                "entries" => {
                    let OrderedEntries(entries) = map.next_value()?;
                    for (key, ops) in entries {
                        for op in ops {
                            batch.push_raw(key.clone(), op);
                        }
                    }
                }
                _ => {
                    map.next_value::<de::IgnoredAny>()?;
                }
            }
        }
        Ok(batch)
    }
}

/// Key -> operations map read in document order
struct OrderedEntries(Vec<(OperationKey, Vec<BatchOperation>)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of key tokens to operation lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<OrderedEntries, A::Error> {
                let mut entries = Vec::new();
                while let Some((token, ops)) = map.next_entry::<String, Vec<BatchOperation>>()? {
                    let key = OperationKey::from_token(&token).map_err(de::Error::custom)?;
                    entries.push((key, ops));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// `Option<RecordId>` as `"#c:p"` or `null`
mod legible_rid {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::record::RecordId;

    pub fn serialize<S: Serializer>(rid: &Option<RecordId>, serializer: S) -> Result<S::Ok, S::Error> {
        match rid {
            Some(rid) => serializer.serialize_str(&rid.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<RecordId>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => text.parse().map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}
