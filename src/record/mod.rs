//! Record Module
//!
//! Documents, their identities, and the record store the index layer consumes.
//!
//! ## Responsibilities
//! - `RecordId`: `#cluster:position` identity, negative positions are temporary
//! - `Record`: a JSON document living in a named container
//! - `RecordStore`: load/save/delete/browse interface of the record layer
//! - `MemoryRecordStore`: in-process reference implementation

mod document;
mod id;
mod store;

pub use document::Record;
pub use id::RecordId;
pub use store::{Intent, MemoryRecordStore, RecordStore};
