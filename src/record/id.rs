//! Record identity
//!
//! A record is addressed by the container (cluster) it lives in and its
//! position inside that container.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Identity of a record: `#cluster:position`
///
/// Ordered by cluster, then position. Negative positions mark temporary
/// identities handed out inside an optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster: u32,
    pub position: i64,
}

impl RecordId {
    pub const fn new(cluster: u32, position: i64) -> Self {
        Self { cluster, position }
    }

    /// Whether this identity was assigned inside a transaction and not yet persisted
    pub fn is_temporary(&self) -> bool {
        self.position < 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl FromStr for RecordId {
    type Err = AtlasError;

    /// Parse `#12:345` (the leading `#` is optional)
    fn from_str(s: &str) -> Result<Self> {
        let body = s.trim().strip_prefix('#').unwrap_or(s.trim());
        let (cluster, position) = body
            .split_once(':')
            .ok_or_else(|| AtlasError::Serialization(format!("Invalid record id: '{}'", s)))?;

        let cluster = cluster
            .parse()
            .map_err(|_| AtlasError::Serialization(format!("Invalid cluster in record id: '{}'", s)))?;
        let position = position
            .parse()
            .map_err(|_| AtlasError::Serialization(format!("Invalid position in record id: '{}'", s)))?;

        Ok(Self { cluster, position })
    }
}
