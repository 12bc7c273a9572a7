//! # AtlasDoc
//!
//! An embeddable document database built around transactional secondary
//! indexes:
//! - Disk-backed ordered trees with partial memory residency
//! - Memory-pressure driven eviction under a per-index RwLock
//! - Buffered transactions replayed in deterministic order at commit
//! - Identifier sets that move out of their leaf once they grow large
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Database                              │
//! │          (NO_TX / OPTIMISTIC, listeners, cache)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  Active Transaction                          │
//! │        (record buffer + per-index commit batches)            │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐               ┌───────────────────┐
//!   │  Record Store   │               │  Index (RwLock)   │◄── Memory
//!   │                 │               │                   │    Monitor
//!   └─────────────────┘               └─────────┬─────────┘
//!                                               │
//!                                               ▼
//!                                     ┌───────────────────┐
//!                                     │ PersistentTreeMap │
//!                                     │  (hot set + root) │
//!                                     └─────────┬─────────┘
//!                                               │
//!                                               ▼
//!                                     ┌───────────────────┐
//!                                     │    Node Store     │
//!                                     └───────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod storage;
pub mod tree;
pub mod memory;
pub mod index;
pub mod tx;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::Config;
pub use db::Database;
pub use index::{Index, IndexDefinition, IndexKey, IndexKind, IndexManager};
pub use record::{Record, RecordId};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasDoc
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
