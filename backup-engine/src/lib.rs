//! Backup Engine Library
//!
//! Incremental directory backups into zip, 7z, tar.gz and tar.bz2 archives,
//! with content-hash change detection and a locked-file tolerant copier.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fs;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use archive::ArchiveFormat;
pub use config::{Config, CopyPolicy, LockedFileStrategy};
pub use executor::worker::{BackupWorker, JobHandle, ProgressUpdate};
pub use executor::{BackupEngine, BackupOutcome, BackupRequest, RestoreOutcome};
pub use transfer::{CopySummary, ProgressSink};
pub use utils::errors::{EngineError, Result};
