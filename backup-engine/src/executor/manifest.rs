//! Per-destination metadata for incremental backups.
//!
//! Each destination directory holds `.backup-metadata.json` recording the last
//! seen content hash of every source file and the log of backups written
//! there. Losing this file only degrades the next run to "everything is new".

use crate::archive::ArchiveFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const METADATA_FILENAME: &str = ".backup-metadata.json";

/// Metadata store, serialized as `.backup-metadata.json` in each destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataStore {
    /// Relative path (`/`-separated) -> hex content digest
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Backups in the order they were written
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
}

/// One completed backup archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub filename: String,
    /// `YYYYMMDD_HHMMSS`
    pub timestamp: String,
    pub format: ArchiveFormat,
    pub incremental: bool,
    pub files_count: usize,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage saved, rounded to 2 decimals
    pub compression_ratio: f64,
    pub source_dir: String,
}

/// Percentage of `original_size` saved by compression, 0 for empty input
pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let ratio = (original_size as f64 - compressed_size as f64) / original_size as f64 * 100.0;
    (ratio * 100.0).round() / 100.0
}

pub fn metadata_path(dest_dir: &Path) -> PathBuf {
    dest_dir.join(METADATA_FILENAME)
}

impl MetadataStore {
    /// Load the store for `dest_dir`. Missing, unreadable or corrupt files
    /// yield an empty store.
    pub fn load(dest_dir: &Path) -> Self {
        let path = metadata_path(dest_dir);
        if !path.exists() {
            return Self::default();
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read metadata {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<MetadataStore>(&content) {
            Ok(store) => {
                debug!(
                    "Loaded metadata: {} files, {} backups",
                    store.files.len(),
                    store.backups.len()
                );
                store
            }
            Err(e) => {
                warn!("Corrupt metadata {}, starting fresh: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist the store atomically. Failures are logged, never returned.
    pub fn save(&self, dest_dir: &Path) {
        if let Err(e) = self.try_save(dest_dir) {
            warn!(
                "Failed to save metadata to {}: {}",
                metadata_path(dest_dir).display(),
                e
            );
        }
    }

    fn try_save(&self, dest_dir: &Path) -> std::io::Result<()> {
        // Temp file in the same directory so the rename stays on one file system
        let mut temp = tempfile::NamedTempFile::new_in(dest_dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(metadata_path(dest_dir)).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn record_backup(&mut self, record: BackupRecord) {
        self.backups.push(record);
    }
}
