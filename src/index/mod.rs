//! Index Module
//!
//! Secondary indexes over record containers.
//!
//! ## Responsibilities
//! - One ordered key -> identifier-set tree per declared index
//! - Kind-specific put semantics (unique, not unique, full text, dictionary)
//! - Rebuild from the watched containers with progress reporting
//! - Replay of buffered transaction batches in buffering order
//! - Memory-pressure driven optimization under the index's exclusive lock
//! - Case-insensitive registry with persisted configuration snapshots

mod definition;
mod engine;
mod extractor;
mod key;
mod kind;
mod manager;
mod progress;

pub use definition::{IndexDefinition, IndexSnapshot};
pub use engine::{Index, IndexCursor, IndexSettings, IndexStatus};
pub use extractor::{FieldExtractor, ValueExtractor};
pub use key::{IndexKey, KeyType};
pub use kind::IndexKind;
pub use manager::IndexManager;
pub use progress::{LoggingProgressListener, ProgressListener};
