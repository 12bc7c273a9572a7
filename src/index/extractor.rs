//! Extraction of index keys from records

use crate::error::{AtlasError, Result};
use crate::record::Record;

use super::{IndexKey, KeyType};

/// Computes the key under which a record is indexed
pub trait ValueExtractor: Send + Sync {
    /// `Ok(None)` means the record is not indexed
    fn value_to_index(&self, record: &Record) -> Result<Option<IndexKey>>;
}

/// Indexes the value of one named field
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    field: String,
    key_type: Option<KeyType>,
}

impl FieldExtractor {
    pub fn new(field: impl Into<String>, key_type: Option<KeyType>) -> Self {
        Self {
            field: field.into(),
            key_type,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl ValueExtractor for FieldExtractor {
    fn value_to_index(&self, record: &Record) -> Result<Option<IndexKey>> {
        let Some(value) = record.field(&self.field) else {
            return Ok(None);
        };

        IndexKey::from_json(value, self.key_type).map_err(|e| {
            AtlasError::Extraction(format!(
                "Field '{}' of record {}: {}",
                self.field,
                record.id.map(|id| id.to_string()).unwrap_or_else(|| "<new>".to_string()),
                e
            ))
        })
    }
}

impl<F> ValueExtractor for F
where
    F: Fn(&Record) -> Result<Option<IndexKey>> + Send + Sync,
{
    fn value_to_index(&self, record: &Record) -> Result<Option<IndexKey>> {
        self(record)
    }
}
