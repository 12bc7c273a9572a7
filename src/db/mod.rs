//! Database Module
//!
//! The application-facing handle: records, transactions and automatic index
//! maintenance.
//!
//! ## Transaction States
//! ```text
//!            begin()                      commit() / rollback()
//!   NO_TX ────────────► OPTIMISTIC ──────────────────────────► NO_TX
//!     ▲                    │  begin(): implicit rollback          (always,
//!     │                    └──────────► OPTIMISTIC (new id)        even on error)
//!     └─ every operation applies immediately
//! ```

mod cache;
mod database;
mod listener;

pub use cache::RecordCache;
pub use database::Database;
pub use listener::DatabaseListener;
