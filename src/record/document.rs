//! Document records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RecordId;

/// A schemaless document stored in a named container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identity, `None` until the record is first saved
    pub id: Option<RecordId>,

    /// Container (cluster) the record lives in
    pub container: String,

    /// Optional class the document belongs to
    pub class_name: Option<String>,

    /// Document fields
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty, unsaved record for the given container
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            id: None,
            container: container.into(),
            class_name: None,
            fields: Map::new(),
        }
    }

    /// Set the class name (builder style)
    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Set a field (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set or replace a field
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Remove a field, returning its previous value
    pub fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn id(&self) -> Option<RecordId> {
        self.id
    }
}
