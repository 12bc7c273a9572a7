//! Index keys
//!
//! A closed set of comparable key values. Keys of different types are
//! ordered by type rank inside a tree but are never mutually comparable as
//! range bounds.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AtlasError, Result};
use crate::record::RecordId;
use crate::tree::TreeKey;

/// Type tag of an `IndexKey`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Boolean,
    Integer,
    Double,
    DateTime,
    String,
    Binary,
    Link,
}

impl KeyType {
    /// Stable id of the runtime key serializer, persisted in index snapshots
    pub fn serializer_id(self) -> u8 {
        match self {
            KeyType::Boolean => 1,
            KeyType::DateTime => 5,
            KeyType::Double => 6,
            KeyType::Link => 9,
            KeyType::Integer => 10,
            KeyType::String => 13,
            KeyType::Binary => 17,
        }
    }

    pub fn from_serializer_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => KeyType::Boolean,
            5 => KeyType::DateTime,
            6 => KeyType::Double,
            9 => KeyType::Link,
            10 => KeyType::Integer,
            13 => KeyType::String,
            17 => KeyType::Binary,
            _ => return None,
        })
    }

    fn rank(self) -> u8 {
        match self {
            KeyType::Boolean => 0,
            KeyType::Integer => 1,
            KeyType::Double => 2,
            KeyType::DateTime => 3,
            KeyType::String => 4,
            KeyType::Binary => 5,
            KeyType::Link => 6,
        }
    }
}

/// A value stored as a key of an index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKey {
    Bool(bool),
    Integer(i64),
    /// Ordered with `f64::total_cmp`
    Double(f64),
    /// Milliseconds since the Unix epoch
    DateTime(i64),
    String(String),
    Binary(Vec<u8>),
    Link(RecordId),
}

impl IndexKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            IndexKey::Bool(_) => KeyType::Boolean,
            IndexKey::Integer(_) => KeyType::Integer,
            IndexKey::Double(_) => KeyType::Double,
            IndexKey::DateTime(_) => KeyType::DateTime,
            IndexKey::String(_) => KeyType::String,
            IndexKey::Binary(_) => KeyType::Binary,
            IndexKey::Link(_) => KeyType::Link,
        }
    }

    /// Convert a document field value into a key
    ///
    /// `null` means "do not index". With an expected type the value is
    /// coerced where the conversion is lossless; otherwise the type is
    /// inferred from the JSON value.
    pub fn from_json(value: &Value, expected: Option<KeyType>) -> Result<Option<Self>> {
        if value.is_null() {
            return Ok(None);
        }

        let key = match expected {
            None => Self::infer(value)?,
            Some(key_type) => Self::coerce(value, key_type)?,
        };
        Ok(Some(key))
    }

    /// JSON rendering of the key value (without the type tag)
    pub fn to_json(&self) -> Value {
        match self {
            IndexKey::Bool(b) => Value::Bool(*b),
            IndexKey::Integer(i) | IndexKey::DateTime(i) => Value::from(*i),
            IndexKey::Double(d) => Value::from(*d),
            IndexKey::String(s) => Value::String(s.clone()),
            IndexKey::Binary(bytes) => Value::from(bytes.clone()),
            IndexKey::Link(rid) => Value::String(rid.to_string()),
        }
    }

    /// Lowercase words of a string key, for full-text indexing
    pub fn words(&self) -> Vec<IndexKey> {
        match self {
            IndexKey::String(text) => {
                let mut words: Vec<String> = text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_lowercase)
                    .collect();
                words.sort();
                words.dedup();
                words.into_iter().map(IndexKey::String).collect()
            }
            other => vec![other.clone()],
        }
    }

    fn infer(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(IndexKey::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(IndexKey::Integer(i)),
                None => n
                    .as_f64()
                    .map(IndexKey::Double)
                    .ok_or_else(|| AtlasError::KeyType(format!("Unsupported number {}", n))),
            },
            Value::String(s) => Ok(IndexKey::String(s.clone())),
            other => Err(AtlasError::KeyType(format!("Cannot index value {}", other))),
        }
    }

    fn coerce(value: &Value, key_type: KeyType) -> Result<Self> {
        let mismatch = || AtlasError::KeyType(format!("Cannot convert {} to {:?}", value, key_type));

        match key_type {
            KeyType::Boolean => value.as_bool().map(IndexKey::Bool).ok_or_else(mismatch),
            KeyType::Integer => match value {
                Value::String(s) => s.trim().parse().map(IndexKey::Integer).map_err(|_| mismatch()),
                _ => value.as_i64().map(IndexKey::Integer).ok_or_else(mismatch),
            },
            KeyType::Double => match value {
                Value::String(s) => s.trim().parse().map(IndexKey::Double).map_err(|_| mismatch()),
                _ => value.as_f64().map(IndexKey::Double).ok_or_else(mismatch),
            },
            KeyType::DateTime => value.as_i64().map(IndexKey::DateTime).ok_or_else(mismatch),
            KeyType::String => match value {
                Value::String(s) => Ok(IndexKey::String(s.clone())),
                Value::Number(n) => Ok(IndexKey::String(n.to_string())),
                Value::Bool(b) => Ok(IndexKey::String(b.to_string())),
                _ => Err(mismatch()),
            },
            KeyType::Binary => match value {
                Value::String(s) => Ok(IndexKey::Binary(s.as_bytes().to_vec())),
                Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(IndexKey::Binary)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            KeyType::Link => match value {
                Value::String(s) => s.parse().map(IndexKey::Link).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Integer(a), IndexKey::Integer(b)) => a.cmp(b),
            (IndexKey::Double(a), IndexKey::Double(b)) => a.total_cmp(b),
            (IndexKey::DateTime(a), IndexKey::DateTime(b)) => a.cmp(b),
            (IndexKey::String(a), IndexKey::String(b)) => a.cmp(b),
            (IndexKey::Binary(a), IndexKey::Binary(b)) => a.cmp(b),
            (IndexKey::Link(a), IndexKey::Link(b)) => a.cmp(b),
            _ => self.key_type().rank().cmp(&other.key_type().rank()),
        }
    }
}

impl TreeKey for IndexKey {
    fn comparable_with(&self, other: &Self) -> bool {
        self.key_type() == other.key_type()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Integer(i) => write!(f, "{}", i),
            IndexKey::Double(d) => write!(f, "{}", d),
            IndexKey::DateTime(ms) => write!(f, "{}ms", ms),
            IndexKey::String(s) => write!(f, "{}", s),
            IndexKey::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            IndexKey::Link(rid) => write!(f, "{}", rid),
        }
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        IndexKey::String(s.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        IndexKey::String(s)
    }
}

impl From<i64> for IndexKey {
    fn from(i: i64) -> Self {
        IndexKey::Integer(i)
    }
}

impl From<bool> for IndexKey {
    fn from(b: bool) -> Self {
        IndexKey::Bool(b)
    }
}

impl From<RecordId> for IndexKey {
    fn from(rid: RecordId) -> Self {
        IndexKey::Link(rid)
    }
}
