//! Configuration for AtlasDoc
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::tree::TreeSettings;

/// Main configuration for an AtlasDoc instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all index data
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── indexes.json         (index manager configuration)
    ///     └── indexes/{name}/      (node files of one index)
    pub data_dir: PathBuf,

    /// Keep every node in memory instead of `data_dir`
    pub in_memory: bool,

    /// fsync every node file as it is written
    pub sync_writes: bool,

    // -------------------------------------------------------------------------
    // Tree Configuration
    // -------------------------------------------------------------------------
    /// Max entries per leaf node before it splits
    pub page_size: usize,

    /// Updates between automatic lazy saves (0 disables)
    pub max_updates_before_save: usize,

    /// Resident entries above which a soft optimization runs (0 disables)
    pub optimize_threshold: usize,

    // -------------------------------------------------------------------------
    // RID Set Configuration
    // -------------------------------------------------------------------------
    /// Set size above which a value set moves to the external encoding
    /// (0 keeps every set embedded)
    pub rid_binary_threshold: usize,

    /// Max entries per leaf of an external RID set tree
    pub rid_page_size: usize,

    // -------------------------------------------------------------------------
    // Memory Watchdog Configuration
    // -------------------------------------------------------------------------
    /// Run the background memory watchdog
    pub watchdog_enabled: bool,

    /// Polling interval of the watchdog (milliseconds)
    pub watchdog_interval_ms: u64,

    /// Available-memory percentage below which a soft signal fires
    pub memory_soft_threshold_pct: f64,

    /// Available-memory percentage below which a hard signal fires
    pub memory_hard_threshold_pct: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlasdoc_data"),
            in_memory: false,
            sync_writes: false,
            page_size: 256,
            max_updates_before_save: 5000,
            optimize_threshold: 100_000,
            rid_binary_threshold: 8,
            rid_page_size: 64,
            watchdog_enabled: true,
            watchdog_interval_ms: 1000,
            memory_soft_threshold_pct: 20.0,
            memory_hard_threshold_pct: 10.0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Settings for the main key -> RID set tree of an index
    pub fn tree_settings(&self) -> TreeSettings {
        TreeSettings {
            page_size: self.page_size,
            max_updates_before_save: self.max_updates_before_save,
            optimize_threshold: self.optimize_threshold,
        }
    }

    /// Settings for the nested trees backing external RID sets
    pub fn rid_tree_settings(&self) -> TreeSettings {
        TreeSettings {
            page_size: self.rid_page_size,
            max_updates_before_save: 0,
            optimize_threshold: 0,
        }
    }

    /// Watchdog polling interval
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Directory holding the node files of the named index
    pub fn index_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("indexes").join(name.to_lowercase())
    }

    /// Path of the index manager configuration file
    pub fn index_manager_path(&self) -> PathBuf {
        self.data_dir.join("indexes.json")
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Keep all nodes in memory
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.config.in_memory = in_memory;
        self
    }

    /// fsync node files as they are written
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    /// Set the leaf page size (entries per node)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the number of updates between automatic lazy saves
    pub fn max_updates_before_save(mut self, count: usize) -> Self {
        self.config.max_updates_before_save = count;
        self
    }

    /// Set the resident-entry high-water mark that triggers optimization
    pub fn optimize_threshold(mut self, count: usize) -> Self {
        self.config.optimize_threshold = count;
        self
    }

    /// Set the embedded -> external RID set threshold
    pub fn rid_binary_threshold(mut self, count: usize) -> Self {
        self.config.rid_binary_threshold = count;
        self
    }

    /// Set the leaf page size of external RID set trees
    pub fn rid_page_size(mut self, size: usize) -> Self {
        self.config.rid_page_size = size;
        self
    }

    /// Enable or disable the memory watchdog thread
    pub fn watchdog_enabled(mut self, enabled: bool) -> Self {
        self.config.watchdog_enabled = enabled;
        self
    }

    /// Set the watchdog polling interval (in milliseconds)
    pub fn watchdog_interval_ms(mut self, ms: u64) -> Self {
        self.config.watchdog_interval_ms = ms;
        self
    }

    /// Set the soft and hard available-memory watermarks (percent)
    pub fn memory_thresholds(mut self, soft_pct: f64, hard_pct: f64) -> Self {
        self.config.memory_soft_threshold_pct = soft_pct;
        self.config.memory_hard_threshold_pct = hard_pct;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
