//! Index kinds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

use super::IndexKey;

/// How an index treats the identifiers attached to one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexKind {
    /// At most one identifier per key
    Unique,
    /// Any number of identifiers per key
    NotUnique,
    /// Every lowercase word of a string key is indexed
    FullText,
    /// The last identifier put on a key replaces the previous one
    Dictionary,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Unique => "UNIQUE",
            IndexKind::NotUnique => "NOTUNIQUE",
            IndexKind::FullText => "FULLTEXT",
            IndexKind::Dictionary => "DICTIONARY",
        }
    }

    /// Keys actually stored for a logical key
    pub fn keys_for(&self, key: &IndexKey) -> Vec<IndexKey> {
        match self {
            IndexKind::FullText => key.words(),
            IndexKind::Unique | IndexKind::NotUnique | IndexKind::Dictionary => vec![key.clone()],
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "UNIQUE" => Ok(IndexKind::Unique),
            "NOTUNIQUE" => Ok(IndexKind::NotUnique),
            "FULLTEXT" => Ok(IndexKind::FullText),
            "DICTIONARY" => Ok(IndexKind::Dictionary),
            _ => Err(AtlasError::Config(format!("Unknown index type '{}'", s))),
        }
    }
}
