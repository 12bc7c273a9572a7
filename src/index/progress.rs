//! Rebuild progress reporting

use crate::error::Result;

/// Observer of an index rebuild
///
/// Returning an error from `on_progress` aborts the rebuild, which then
/// leaves the index empty.
pub trait ProgressListener {
    fn on_begin(&mut self, total: u64);

    fn on_progress(&mut self, done: u64, percent: f32) -> Result<()>;

    fn on_completion(&mut self, success: bool);
}

/// Logs rebuild progress in 10% steps
#[derive(Debug)]
pub struct LoggingProgressListener {
    index: String,
    last_step: u32,
}

impl LoggingProgressListener {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            last_step: 0,
        }
    }
}

impl ProgressListener for LoggingProgressListener {
    fn on_begin(&mut self, total: u64) {
        self.last_step = 0;
        tracing::info!("Rebuilding index '{}' over {} records", self.index, total);
    }

    fn on_progress(&mut self, done: u64, percent: f32) -> Result<()> {
        let step = (percent / 10.0) as u32;
        if step > self.last_step {
            self.last_step = step;
            tracing::info!("Index '{}': {} records ({:.0}%)", self.index, done, percent);
        }
        Ok(())
    }

    fn on_completion(&mut self, success: bool) {
        if success {
            tracing::info!("Index '{}' rebuilt", self.index);
        } else {
            tracing::warn!("Rebuild of index '{}' failed", self.index);
        }
    }
}
