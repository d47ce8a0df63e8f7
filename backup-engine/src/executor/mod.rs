//! Backup orchestration: scan, archive, record, restore.
//!
//! [`BackupEngine`] is synchronous. Each call runs to completion on the
//! calling thread, reporting progress to the configured sink and checking
//! its cancellation token between files. Use [`worker::BackupWorker`] to run
//! it off an async runtime.

pub mod manifest;
pub mod scanner;
pub mod worker;

use crate::archive::{entry_name, ArchiveEntry, ArchiveFormat};
use crate::config::Config;
use crate::fs::hash::UNKNOWN_DIGEST;
use crate::fs::walker::WalkOptions;
use crate::transfer::copier::{CopySummary, FileAccess, PlatformAccess, ResilientCopier};
use crate::transfer::progress::{format_bytes, NoProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use manifest::{compression_ratio, BackupRecord, MetadataStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What to back up and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    /// `zip`, `7z`, `tar.gz` or `tar.bz2`
    pub format: String,
    pub incremental: bool,
    /// Base name overriding `{source}_{full|incremental}_{timestamp}`
    pub name: Option<String>,
}

impl BackupRequest {
    pub fn new(source_dir: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
            format: ArchiveFormat::Zip.as_str().to_string(),
            incremental: false,
            name: None,
        }
    }

    /// Request using the configured default format and mode
    pub fn from_config(
        source_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
        config: &Config,
    ) -> Self {
        Self::new(source_dir, dest_dir)
            .format(config.backup.default_format.clone())
            .incremental(config.backup.incremental_by_default)
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result of [`BackupEngine::create_backup`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BackupOutcome {
    Success {
        #[serde(flatten)]
        record: BackupRecord,
        backup_file: PathBuf,
        /// Selected files that could not be read and were left out
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        error_details: Vec<(PathBuf, String)>,
    },
    /// Nothing selected; no archive written and metadata left untouched
    Skipped {
        message: String,
        files_count: usize,
        size: u64,
    },
}

impl BackupOutcome {
    pub fn files_count(&self) -> usize {
        match self {
            Self::Success { record, .. } => record.files_count,
            Self::Skipped { files_count, .. } => *files_count,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Result of a restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub status: String,
    pub message: String,
    pub restore_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_summary: Option<CopySummary>,
}

impl RestoreOutcome {
    fn success(restore_dir: &Path, copy_summary: Option<CopySummary>) -> Self {
        Self {
            status: "success".to_string(),
            message: format!("Backup restored to {}", restore_dir.display()),
            restore_dir: restore_dir.to_path_buf(),
            copy_summary,
        }
    }
}

/// Archive name for a backup: explicit base name or
/// `{source}_{incremental|full}_{timestamp}`, plus the format extension
pub fn backup_filename(
    source_dir: &Path,
    name: Option<&str>,
    incremental: bool,
    timestamp: &str,
    format: ArchiveFormat,
) -> String {
    let base = match name {
        Some(name) => name.to_string(),
        None => {
            let source_name = source_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "backup".to_string());
            let kind = if incremental { "incremental" } else { "full" };
            format!("{}_{}_{}", source_name, kind, timestamp)
        }
    };
    format!("{}{}", base, format.extension())
}

/// Main backup engine
pub struct BackupEngine<A: FileAccess = PlatformAccess> {
    config: Config,
    copier: ResilientCopier<A>,
    walk_options: WalkOptions,
    progress: Arc<dyn ProgressSink>,
    cancel_token: CancellationToken,
}

impl BackupEngine {
    /// Create an engine with no progress reporting and its own cancellation token
    pub fn new(config: Config) -> Self {
        Self::with_access(config, PlatformAccess)
    }
}

impl<A: FileAccess> BackupEngine<A> {
    /// Create an engine whose source and destination files go through `access`
    pub fn with_access(config: Config, access: A) -> Self {
        let copier = ResilientCopier::with_access(config.copy_policy(), access);
        Self {
            config,
            copier,
            walk_options: WalkOptions::default(),
            progress: Arc::new(NoProgress),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_walk_options(mut self, walk_options: WalkOptions) -> Self {
        self.walk_options = walk_options;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Create a full or incremental backup of `request.source_dir`.
    ///
    /// The format is validated before anything touches the disk. When no file
    /// is selected the result is [`BackupOutcome::Skipped`] and no archive or
    /// metadata is written. Selected files that cannot be read even through
    /// the locked-file fallbacks are left out of the archive, listed in
    /// `error_details`, and stored with an unknown digest so the next
    /// incremental run tries them again.
    pub fn create_backup(&self, request: &BackupRequest) -> Result<BackupOutcome> {
        let start_time = Instant::now();
        let format: ArchiveFormat = request.format.parse()?;

        if !request.source_dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "source directory {}",
                request.source_dir.display()
            )));
        }

        info!(
            "Starting {} {} backup of {} into {}",
            if request.incremental { "incremental" } else { "full" },
            format,
            request.source_dir.display(),
            request.dest_dir.display()
        );

        fs::create_dir_all(&request.dest_dir)?;
        let mut store = MetadataStore::load(&request.dest_dir);

        self.progress.on_progress(0, "Starting file analysis...");
        let selected = scanner::select_files(
            &request.source_dir,
            request.incremental,
            &mut store,
            &self.walk_options,
            &self.copier,
            self.progress.as_ref(),
            &self.cancel_token,
        )?;

        if selected.is_empty() {
            info!("No modified files found in {}", request.source_dir.display());
            return Ok(BackupOutcome::Skipped {
                message: "No modified files found".to_string(),
                files_count: 0,
                size: 0,
            });
        }

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let filename = backup_filename(
            &request.source_dir,
            request.name.as_deref(),
            request.incremental,
            &timestamp,
            format,
        );
        let output = request.dest_dir.join(&filename);

        self.progress.on_progress(0, "Starting compression...");
        let paths: Vec<PathBuf> = selected.iter().map(|f| f.path.clone()).collect();
        let report = format.codec(self.config.backup.compression_level).write(
            &paths,
            &request.source_dir,
            &output,
            &self.copier,
            self.progress.as_ref(),
            &self.cancel_token,
        )?;

        for (path, reason) in &report.skipped {
            warn!("Not backed up: {} ({})", path.display(), reason);
            store.files.insert(
                entry_name(path, &request.source_dir),
                UNKNOWN_DIGEST.to_string(),
            );
        }

        if report.written.is_empty() {
            if let Err(e) = fs::remove_file(&output) {
                warn!("Failed to remove empty archive {}: {}", output.display(), e);
            }
            warn!(
                "None of the {} selected files in {} could be read",
                report.skipped.len(),
                request.source_dir.display()
            );
            return Ok(BackupOutcome::Skipped {
                message: "No readable files to back up".to_string(),
                files_count: 0,
                size: 0,
            });
        }

        // Sizes as they are now, not as walked
        let original_size: u64 = report
            .written
            .iter()
            .map(|p| fs::metadata(p).map(|m| m.len()).unwrap_or(0))
            .sum();
        let compressed_size = fs::metadata(&output)?.len();

        let record = BackupRecord {
            filename,
            timestamp,
            format,
            incremental: request.incremental,
            files_count: report.written.len(),
            original_size,
            compressed_size,
            compression_ratio: compression_ratio(original_size, compressed_size),
            source_dir: request.source_dir.to_string_lossy().to_string(),
        };

        store.record_backup(record.clone());
        store.save(&request.dest_dir);

        self.progress.on_progress(100, "Backup complete!");
        info!(
            "Backup {} written: {} files, {} -> {} ({}% saved) in {:?}",
            record.filename,
            record.files_count,
            format_bytes(original_size),
            format_bytes(compressed_size),
            record.compression_ratio,
            start_time.elapsed()
        );

        Ok(BackupOutcome::Success {
            record,
            backup_file: output,
            error_details: report.skipped,
        })
    }

    /// Extract `archive` into `restore_dir`, picking the format from the
    /// file extension.
    pub fn restore_backup(&self, archive: &Path, restore_dir: &Path) -> Result<RestoreOutcome> {
        let format = Self::check_archive(archive)?;

        fs::create_dir_all(restore_dir)?;
        let count = format.codec(self.config.backup.compression_level).extract(
            archive,
            restore_dir,
            self.progress.as_ref(),
            &self.cancel_token,
        )?;

        info!(
            "Restored {} entries from {} to {}",
            count,
            archive.display(),
            restore_dir.display()
        );
        Ok(RestoreOutcome::success(restore_dir, None))
    }

    /// Restore through a staging directory, then move files into place with
    /// the resilient copier so destination files held open elsewhere do not
    /// abort the restore when `skip_locked` is set.
    pub fn restore_backup_tolerant(
        &self,
        archive: &Path,
        restore_dir: &Path,
        skip_locked: bool,
    ) -> Result<RestoreOutcome> {
        let format = Self::check_archive(archive)?;

        let staging = tempfile::TempDir::new()?;
        format.codec(self.config.backup.compression_level).extract(
            archive,
            staging.path(),
            self.progress.as_ref(),
            &self.cancel_token,
        )?;

        fs::create_dir_all(restore_dir)?;
        let summary = self.copier.copy_directory(
            staging.path(),
            restore_dir,
            skip_locked,
            self.progress.as_ref(),
            &self.cancel_token,
        )?;

        if summary.error_count > 0 {
            warn!(
                "Restore of {} finished with {} files not written",
                archive.display(),
                summary.error_count
            );
        }

        Ok(RestoreOutcome::success(restore_dir, Some(summary)))
    }

    /// Copy a tree with the engine's locked-file policy
    pub fn copy_directory(&self, src: &Path, dst: &Path, skip_locked: bool) -> Result<CopySummary> {
        if !src.is_dir() {
            return Err(EngineError::NotFound(format!("directory {}", src.display())));
        }
        self.copier.copy_directory(
            src,
            dst,
            skip_locked,
            self.progress.as_ref(),
            &self.cancel_token,
        )
    }

    /// Backups recorded in `dest_dir`, oldest first
    pub fn list_backups(&self, dest_dir: &Path) -> Vec<BackupRecord> {
        MetadataStore::load(dest_dir).backups
    }

    /// Entries stored in `archive`
    pub fn list_archive(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let format = Self::check_archive(archive)?;
        format.codec(self.config.backup.compression_level).list(archive)
    }

    /// Existence first, then extension; both before any write
    fn check_archive(archive: &Path) -> Result<ArchiveFormat> {
        if !archive.exists() {
            return Err(EngineError::NotFound(format!(
                "backup file {}",
                archive.display()
            )));
        }
        ArchiveFormat::from_archive_path(archive)
    }
}
