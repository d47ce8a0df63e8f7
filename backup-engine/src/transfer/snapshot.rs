//! Volume snapshot copy strategy.
//!
//! Not implemented. Copying through a volume snapshot needs the platform
//! snapshot service (VSS on Windows), which this crate does not drive. The
//! strategy always reports itself unavailable so the fallback chain moves on
//! to the shared-read copy.

use std::path::Path;
use thiserror::Error;

/// Why the snapshot strategy could not copy a file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SnapshotUnavailable(pub &'static str);

pub fn snapshot_copy(_src: &Path, _dst: &Path) -> Result<u64, SnapshotUnavailable> {
    if cfg!(windows) {
        Err(SnapshotUnavailable("volume snapshot copy not implemented"))
    } else {
        Err(SnapshotUnavailable("volume snapshots only available on Windows"))
    }
}
