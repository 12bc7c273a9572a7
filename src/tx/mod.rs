//! Transaction Module
//!
//! Buffers record and index mutations and applies them at commit.
//!
//! ## Responsibilities
//! - Per-transaction record buffer (last write per identity wins)
//! - Per-index ordered operation logs, replayed in buffering order
//! - Temporary identities for created records, remapped at commit
//! - Commit and rollback protocols that never leave half-applied state
//!   resident in memory

mod batch;
mod entry;
mod transaction;

pub use batch::{BatchOperation, CommitBatch};
pub use entry::{IndexOpStatus, IndexOperation, OperationKey, RecordEntry, RecordStatus};
pub use transaction::{
    ActiveTransaction, CommitOutcome, NoTx, OptimisticTransaction, RecordOperations, TxContext, TxMode,
};
