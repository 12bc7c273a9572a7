//! Memory Module
//!
//! Process-wide memory-pressure signal and the watchdog that raises it.
//!
//! ## Responsibilities
//! - Broadcast a typed pressure level to every subscribed index
//! - Sample system memory on a background thread and classify it
//! - Keep eviction off the watchdog thread: subscribers only see a flag
//!
//! ## Flow
//! ```text
//!   watchdog thread                 index (next operation)
//!   ───────────────                 ──────────────────────
//!   probe.sample()
//!   classify(sample) ──► signal ──► flag.fetch_max(level)
//!                                   take() under write lock
//!                                   optimize(soft | hard)
//! ```
//!
//! ## Pressure Thresholds
//! - available > soft watermark: `None`
//! - hard < available <= soft:   `Soft` (evict least recently used half)
//! - available <= hard:          `Hard` (evict every unpinned leaf)

mod monitor;
mod probe;

pub use monitor::{MemoryMonitor, PressureLevel, PressureSubscription};
pub use probe::{classify, parse_meminfo, MemoryProbe, MemorySample, SystemMemoryProbe};
