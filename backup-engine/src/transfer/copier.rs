//! Locked-file tolerant copying.
//!
//! Each file goes through a fallback chain:
//!
//! 1. direct copy, retried with a fixed delay while the error is
//!    permission-class (another process holds the file),
//! 2. the volume snapshot strategy (always unavailable, see [`super::snapshot`]),
//! 3. a streaming copy that opens the source in shared-read mode.
//!
//! Any other I/O error fails the file immediately.
//!
//! Archive entries are opened through the same chain minus the snapshot step
//! (see [`SourceOpener`]).

use super::progress::{PhaseProgress, ProgressSink};
use super::snapshot::{self, SnapshotUnavailable};
use crate::config::CopyPolicy;
use crate::fs::filter::should_skip_file;
use crate::fs::metadata::copy_metadata;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunk size for shared-read streaming copies (1 MiB)
pub const SHARED_COPY_CHUNK: usize = 1024 * 1024;

/// Windows sharing/lock violation error codes
#[cfg(windows)]
const SHARING_VIOLATIONS: [i32; 2] = [32, 33];

/// The three ways of getting a file's bytes to its destination.
///
/// The default methods hit the real file system.
pub trait FileAccess: Send + Sync {
    fn direct_copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        direct_copy(src, dst)
    }

    fn snapshot_copy(&self, src: &Path, dst: &Path) -> std::result::Result<u64, SnapshotUnavailable> {
        snapshot::snapshot_copy(src, dst)
    }

    fn shared_copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        shared_read_copy(src, dst)
    }

    fn direct_open(&self, src: &Path) -> io::Result<File> {
        File::open(src)
    }

    fn shared_open(&self, src: &Path) -> io::Result<File> {
        open_shared(src)
    }
}

/// Opens source files for reading on behalf of the scanner and archive
/// writers. The error is a human-readable reason; callers skip the file.
pub trait SourceOpener: Send + Sync {
    fn open_source(&self, src: &Path) -> std::result::Result<File, String>;
}

/// File access through the host file system
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformAccess;

impl FileAccess for PlatformAccess {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyState {
    Copied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStrategy {
    Direct,
    Snapshot,
    SharedRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Permission-class error that survived every fallback
    Locked,
    /// Any other I/O error
    Io,
}

/// Result of copying a single file
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub state: CopyState,
    /// Strategy that produced the copy, when it succeeded
    pub strategy: Option<CopyStrategy>,
    /// Direct-copy attempts made
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl CopyOutcome {
    fn copied(strategy: CopyStrategy, attempts: u32, bytes: u64) -> Self {
        Self {
            state: CopyState::Copied,
            strategy: Some(strategy),
            attempts,
            bytes,
            error: None,
            failure: None,
        }
    }

    fn failed(kind: FailureKind, attempts: u32, message: String) -> Self {
        Self {
            state: CopyState::Failed,
            strategy: None,
            attempts,
            bytes: 0,
            error: Some(message),
            failure: Some(kind),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == CopyState::Copied
    }

    /// Convert a failed outcome into the error that aborts a strict copy
    fn into_error(self, path: &Path) -> EngineError {
        let detail = self.error.unwrap_or_default();
        match self.failure {
            Some(FailureKind::Locked) => EngineError::LockedResource {
                path: path.to_path_buf(),
                detail,
            },
            _ => EngineError::TransientIo {
                path: path.to_path_buf(),
                detail,
            },
        }
    }
}

/// Aggregate of a directory-level copy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopySummary {
    pub total_files: usize,
    pub copied_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub skipped_paths: Vec<PathBuf>,
    pub error_details: Vec<(PathBuf, String)>,
}

impl CopySummary {
    pub fn record(&mut self, path: &Path, outcome: &CopyOutcome) {
        self.total_files += 1;
        match outcome.state {
            CopyState::Copied => self.copied_count += 1,
            CopyState::Skipped => {
                self.skipped_count += 1;
                self.skipped_paths.push(path.to_path_buf());
            }
            CopyState::Failed => {
                self.error_count += 1;
                self.error_details.push((
                    path.to_path_buf(),
                    outcome.error.clone().unwrap_or_default(),
                ));
            }
        }
    }

    fn record_skipped(&mut self, path: &Path) {
        let outcome = CopyOutcome {
            state: CopyState::Skipped,
            strategy: None,
            attempts: 0,
            bytes: 0,
            error: None,
            failure: None,
        };
        self.record(path, &outcome);
    }
}

/// Copies files through the fallback chain described by a [`CopyPolicy`]
pub struct ResilientCopier<A: FileAccess = PlatformAccess> {
    policy: CopyPolicy,
    access: A,
}

impl ResilientCopier {
    pub fn new(policy: CopyPolicy) -> Self {
        Self::with_access(policy, PlatformAccess)
    }
}

impl<A: FileAccess> ResilientCopier<A> {
    pub fn with_access(policy: CopyPolicy, access: A) -> Self {
        Self { policy, access }
    }

    pub fn policy(&self) -> &CopyPolicy {
        &self.policy
    }

    /// Run the fallback chain for one file. Never panics on I/O errors; the
    /// outcome carries the failure instead.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> CopyOutcome {
        let (attempt, result) = self.retry_direct(src, || self.access.direct_copy(src, dst));

        let permission_error = match result {
            Ok(bytes) => return CopyOutcome::copied(CopyStrategy::Direct, attempt, bytes),
            Err(e) if is_permission_class(&e) => e,
            Err(e) => {
                return CopyOutcome::failed(
                    FailureKind::Io,
                    attempt,
                    format!("{:?}: {}", e.kind(), e),
                );
            }
        };

        let mut message = format!("permission denied: {}", permission_error);

        if self.policy.use_snapshot {
            match self.access.snapshot_copy(src, dst) {
                Ok(bytes) => return CopyOutcome::copied(CopyStrategy::Snapshot, attempt, bytes),
                Err(reason) => message.push_str(&format!(" | snapshot: {}", reason)),
            }
        }

        if self.policy.use_shared_mode {
            match self.access.shared_copy(src, dst) {
                Ok(bytes) => {
                    info!("Copied in shared-read mode: {}", src.display());
                    return CopyOutcome::copied(CopyStrategy::SharedRead, attempt, bytes);
                }
                Err(e) => message.push_str(&format!(" | shared: {}", e)),
            }
        }

        CopyOutcome::failed(FailureKind::Locked, attempt, message)
    }

    /// Run `op` until it succeeds, fails with a non-permission error, or
    /// runs out of attempts. Returns the attempts made and the last result.
    fn retry_direct<T, F>(&self, src: &Path, mut op: F) -> (u32, io::Result<T>)
    where
        F: FnMut() -> io::Result<T>,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Err(e) if is_permission_class(&e) && attempt < max_attempts => {
                    debug!(
                        "Attempt {} failed for {}, retrying in {:?}",
                        attempt,
                        src.display(),
                        self.policy.retry_delay
                    );
                    std::thread::sleep(self.policy.retry_delay);
                }
                result => return (attempt, result),
            }
        }
    }

    /// Copy a whole tree from `src_dir` into `dst_dir`.
    ///
    /// With `skip_locked` failures are collected in the summary; without it
    /// the first failed file aborts the copy.
    pub fn copy_directory(
        &self,
        src_dir: &Path,
        dst_dir: &Path,
        skip_locked: bool,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<CopySummary> {
        let files = walk_directory(src_dir, &WalkOptions::default())?;
        let mut summary = CopySummary::default();
        let mut phase = PhaseProgress::new(progress, "Copying", files.len());

        info!(
            "Copying {} files from {} to {}",
            files.len(),
            src_dir.display(),
            dst_dir.display()
        );

        for file in &files {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let key = file.relative_key();
            phase.advance(&key);

            if self.policy.skip_system_files && should_skip_file(&file.relative_path) {
                if self.policy.log_skipped_files {
                    info!("Skipping system file: {}", file.path.display());
                }
                summary.record_skipped(&file.path);
                continue;
            }

            let dst = dst_dir.join(&file.relative_path);
            let outcome = self.copy_file(&file.path, &dst);

            if !outcome.succeeded() {
                warn!(
                    "Failed to copy {}: {}",
                    file.path.display(),
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                if !skip_locked {
                    return Err(outcome.into_error(&file.path));
                }
            }

            summary.record(&file.path, &outcome);
        }

        info!(
            "Copy finished: {} copied, {} skipped, {} errors",
            summary.copied_count, summary.skipped_count, summary.error_count
        );

        Ok(summary)
    }
}

impl<A: FileAccess> SourceOpener for ResilientCopier<A> {
    /// Direct open with retries, then shared-read when enabled
    fn open_source(&self, src: &Path) -> std::result::Result<File, String> {
        let (_, result) = self.retry_direct(src, || self.access.direct_open(src));

        let permission_error = match result {
            Ok(file) => return Ok(file),
            Err(e) if is_permission_class(&e) => e,
            Err(e) => return Err(format!("{:?}: {}", e.kind(), e)),
        };

        let mut message = format!("permission denied: {}", permission_error);
        if self.policy.use_shared_mode {
            match self.access.shared_open(src) {
                Ok(file) => {
                    info!("Opened in shared-read mode: {}", src.display());
                    return Ok(file);
                }
                Err(e) => message.push_str(&format!(" | shared: {}", e)),
            }
        }

        Err(message)
    }
}

/// Whether an error means "someone else holds this file"
pub fn is_permission_class(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }

    #[cfg(windows)]
    if let Some(code) = err.raw_os_error() {
        return SHARING_VIOLATIONS.contains(&code);
    }

    false
}

/// Standard copy, creating the destination directory and carrying timestamps
pub fn direct_copy(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = fs::copy(src, dst)?;

    if let Err(e) = copy_metadata(src, dst) {
        debug!("Could not copy metadata to {}: {}", dst.display(), e);
    }

    Ok(bytes)
}

/// Open `path` for reading while tolerating other readers and writers
pub fn open_shared(path: &Path) -> io::Result<File> {
    let mut options = File::options();
    options.read(true);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }

    options.open(path)
}

/// Stream `src` into `dst` in [`SHARED_COPY_CHUNK`] pieces.
///
/// Metadata copy is best-effort and never fails the copy.
pub fn shared_read_copy(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = open_shared(src)?;

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = File::create(dst)?;

    let mut buffer = vec![0u8; SHARED_COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    drop(writer);

    if let Err(e) = copy_metadata(src, dst) {
        debug!("Could not copy metadata to {}: {}", dst.display(), e);
    }

    Ok(total)
}
