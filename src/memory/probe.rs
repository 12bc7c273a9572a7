//! System memory sampling

use std::fs;
use std::path::PathBuf;

use crate::error::{AtlasError, Result};

use super::PressureLevel;

/// One reading of system memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySample {
    /// Available memory as a percentage of the total
    pub fn available_pct(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.available_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Source of memory samples for the watchdog
pub trait MemoryProbe: Send {
    fn sample(&mut self) -> Result<MemorySample>;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`
pub struct SystemMemoryProbe {
    path: PathBuf,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Probe reading a meminfo-formatted file at `path`
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&mut self) -> Result<MemorySample> {
        let text = fs::read_to_string(&self.path)?;
        parse_meminfo(&text)
    }
}

/// Parse the `MemTotal`/`MemAvailable` lines of a meminfo document
pub fn parse_meminfo(text: &str) -> Result<MemorySample> {
    let mut total = None;
    let mut available = None;

    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let target = match name.trim() {
            "MemTotal" => &mut total,
            "MemAvailable" => &mut available,
            _ => continue,
        };

        let kib: u64 = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AtlasError::Config(format!("Malformed meminfo line: '{}'", line)))?;
        *target = Some(kib * 1024);
    }

    match (total, available) {
        (Some(total_bytes), Some(available_bytes)) => Ok(MemorySample {
            total_bytes,
            available_bytes,
        }),
        _ => Err(AtlasError::Config(
            "meminfo lacks MemTotal or MemAvailable".to_string(),
        )),
    }
}

/// Map a sample onto a pressure level using the two watermarks
pub fn classify(sample: &MemorySample, soft_pct: f64, hard_pct: f64) -> PressureLevel {
    let available = sample.available_pct();
    if available <= hard_pct {
        PressureLevel::Hard
    } else if available <= soft_pct {
        PressureLevel::Soft
    } else {
        PressureLevel::None
    }
}
