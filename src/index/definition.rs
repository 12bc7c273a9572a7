//! Index definitions and configuration snapshots

use serde::{Deserialize, Serialize};

use crate::storage::NodeId;

use super::{IndexKind, KeyType};

/// Everything needed to declare a new index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub kind: IndexKind,

    /// Maintained by the database on every record save/delete
    pub automatic: bool,

    /// Containers whose records are indexed, in declaration order
    pub containers: Vec<String>,

    /// Field read by the built-in extractor
    pub field: Option<String>,

    /// Expected key type; keys are coerced to it on extraction
    pub key_type: Option<KeyType>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            name: name.into(),
            kind,
            automatic: false,
            containers: Vec::new(),
            field: None,
            key_type: None,
        }
    }

    pub fn automatic(mut self, automatic: bool) -> Self {
        self.automatic = automatic;
        self
    }

    /// Watch another container (case-insensitive, duplicates ignored)
    pub fn on_container(mut self, container: impl Into<String>) -> Self {
        self.add_container(container.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    /// Whether the index watches `container` (case-insensitive)
    pub fn watches(&self, container: &str) -> bool {
        self.containers.iter().any(|c| c.eq_ignore_ascii_case(container))
    }

    pub(crate) fn add_container(&mut self, container: String) -> bool {
        if self.watches(&container) {
            return false;
        }
        self.containers.push(container);
        true
    }

    pub(crate) fn remove_container(&mut self, container: &str) -> bool {
        let before = self.containers.len();
        self.containers.retain(|c| !c.eq_ignore_ascii_case(container));
        self.containers.len() != before
    }

    pub(crate) fn to_snapshot(&self, root: Option<NodeId>) -> IndexSnapshot {
        IndexSnapshot {
            kind: self.kind,
            name: self.name.clone(),
            automatic: self.automatic,
            watched_containers: self.containers.clone(),
            map_root_ref: root,
            runtime_key_serializer_id: self.key_type.map(KeyType::serializer_id),
            field: self.field.clone(),
        }
    }
}

/// Persisted configuration of one index
///
/// ```json
/// {"type":"NOTUNIQUE","name":"by_name","automatic":true,
///  "watchedContainers":["Person"],"mapRootRef":1,"field":"name"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    #[serde(rename = "type")]
    pub kind: IndexKind,

    pub name: String,

    #[serde(default)]
    pub automatic: bool,

    #[serde(default)]
    pub watched_containers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_root_ref: Option<NodeId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_key_serializer_id: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IndexSnapshot {
    /// Definition described by this snapshot (unknown serializer ids are dropped)
    pub fn definition(&self) -> IndexDefinition {
        IndexDefinition {
            name: self.name.clone(),
            kind: self.kind,
            automatic: self.automatic,
            containers: self.watched_containers.clone(),
            field: self.field.clone(),
            key_type: self.runtime_key_serializer_id.and_then(KeyType::from_serializer_id),
        }
    }
}
