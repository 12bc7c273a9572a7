//! Error types for AtlasDoc
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::record::RecordId;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasDoc operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Persistence Errors
    // -------------------------------------------------------------------------
    /// A node could not be read, written or decoded from its backing store
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A configuration references a backing structure that does not exist
    #[error("Missing root: {0}")]
    MissingRoot(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    /// Range bounds are of different key types
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Rebuild failed; the index was left empty
    #[error("Error on rebuilding the index for containers {containers:?}: {source}")]
    IndexBuild {
        containers: Vec<String>,
        #[source]
        source: Box<AtlasError>,
    },

    #[error("Index '{0}' is closed")]
    ClosedIndex(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Index '{0}' already exists")]
    IndexExists(String),

    #[error("Found duplicated key '{key}' in unique index '{index}'")]
    DuplicateKey { index: String, key: String },

    #[error("Key type mismatch: {0}")]
    KeyType(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    // -------------------------------------------------------------------------
    // Record / Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Listener error: {0}")]
    Listener(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for AtlasError {
    fn from(e: serde_json::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}
