//! File metadata handling for copy and restore operations.
//!
//! This module preserves timestamps and permission bits when a file is copied
//! by streaming instead of `std::fs::copy`.

use std::fs::{self, File, FileTimes};
use std::path::Path;
use std::time::SystemTime;

/// Metadata carried over from a source file to its copy
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    pub modified: Option<SystemTime>,

    pub accessed: Option<SystemTime>,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,

    pub readonly: bool,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            accessed: metadata.accessed().ok(),
            permissions,
            readonly: metadata.permissions().readonly(),
        })
    }

    /// Apply timestamps, then permissions, to `path`.
    ///
    /// Permissions go last so a read-only source does not block the
    /// timestamp update.
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        let mut times = FileTimes::new();
        if let Some(modified) = self.modified {
            times = times.set_modified(modified);
        }
        if let Some(accessed) = self.accessed {
            times = times.set_accessed(accessed);
        }
        File::options().write(true).open(path)?.set_times(times)?;

        #[cfg(unix)]
        if let Some(mode) = self.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        #[cfg(not(unix))]
        if self.readonly {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

/// Copy timestamps and permissions from `src` to `dst`
pub fn copy_metadata(src: &Path, dst: &Path) -> std::io::Result<()> {
    FileMetadata::from_path(src)?.apply_to_path(dst)
}
