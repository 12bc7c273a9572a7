//! File Node Store
//!
//! One file per node inside a directory owned by a single index.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AtlasError, Result};

use super::{NodeId, NodeStore};

/// Magic bytes identifying an AtlasDoc node file
const MAGIC: &[u8; 4] = b"ATND";

/// Current node file format version
const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + PayloadLen (4) + CRC (4) = 14 bytes
const HEADER_SIZE: usize = 14;

/// Directory-backed node store
///
/// ## Concurrency:
/// - `next_id`: Atomic counter (lock-free)
/// - Node files are written whole through a temp file and renamed, so a
///   reader never observes a half-written image
pub struct FileNodeStore {
    /// Directory where node files are stored
    dir: PathBuf,

    /// Next id to hand out
    next_id: AtomicU64,

    /// fsync each node file after writing it
    sync_writes: bool,
}

impl FileNodeStore {
    /// Open or create a node store in the given directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing node files
    /// 3. Continue id allocation after the highest id found
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self> {
        fs::create_dir_all(path)?;

        let mut max_id = 0u64;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();

            if file_path.is_file() {
                if let Some(id) = Self::parse_node_id(&file_path) {
                    max_id = max_id.max(id);
                }
            }
        }

        tracing::debug!("Opened node store at {:?}, next id {}", path, max_id + 1);

        Ok(Self {
            dir: path.to_path_buf(),
            next_id: AtomicU64::new(max_id + 1),
            sync_writes,
        })
    }

    /// Get the directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Generate the file path for a node with given ID
    fn node_path(&self, id: NodeId) -> PathBuf {
        self.dir.join(format!("node_{:06}.nd", id.0))
    }

    /// Parse node ID from filename
    /// "node_000042.nd" → Some(42)
    fn parse_node_id(path: &Path) -> Option<u64> {
        if path.extension()? != "nd" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        let id_str = name.strip_prefix("node_")?;
        id_str.parse().ok()
    }

    fn encode(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + bytes.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn decode(id: NodeId, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_SIZE {
            return Err(AtlasError::Persistence(format!(
                "Node {} truncated: {} bytes",
                id,
                data.len()
            )));
        }

        if &data[0..4] != MAGIC {
            return Err(AtlasError::Persistence(format!(
                "Invalid node magic in {}: got {:?}",
                id,
                &data[0..4]
            )));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(AtlasError::Persistence(format!(
                "Unsupported node version {} in {}",
                version, id
            )));
        }

        let len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        let crc = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);

        let payload = &data[HEADER_SIZE..];
        if payload.len() != len {
            return Err(AtlasError::Persistence(format!(
                "Node {} length mismatch: header says {}, found {}",
                id,
                len,
                payload.len()
            )));
        }

        if crc32fast::hash(payload) != crc {
            return Err(AtlasError::Persistence(format!("Checksum mismatch in {}", id)));
        }

        Ok(payload.to_vec())
    }
}

impl NodeStore for FileNodeStore {
    fn allocate(&self) -> Result<NodeId> {
        Ok(NodeId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn write(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        let path = self.node_path(id);
        let tmp = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| AtlasError::Persistence(format!("Cannot create {}: {}", id, e)))?;

        file.write_all(&Self::encode(bytes))
            .map_err(|e| AtlasError::Persistence(format!("Cannot write {}: {}", id, e)))?;

        if self.sync_writes {
            file.sync_all()?;
        }

        fs::rename(&tmp, &path)
            .map_err(|e| AtlasError::Persistence(format!("Cannot install {}: {}", id, e)))?;

        Ok(())
    }

    fn read(&self, id: NodeId) -> Result<Vec<u8>> {
        let mut file = File::open(self.node_path(id))
            .map_err(|e| AtlasError::Persistence(format!("Cannot open {}: {}", id, e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| AtlasError::Persistence(format!("Cannot read {}: {}", id, e)))?;

        Self::decode(id, &data)
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        match fs::remove_file(self.node_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AtlasError::Persistence(format!("Cannot delete {}: {}", id, e))),
        }
    }

    fn sync(&self) -> Result<()> {
        // Directory fsync makes the renames durable (Unix only)
        #[cfg(unix)]
        {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }

    fn contains(&self, id: NodeId) -> bool {
        self.node_path(id).is_file()
    }

    fn node_count(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| Self::parse_node_id(&e.path()).is_some())
                    .count()
            })
            .unwrap_or(0)
    }
}
