//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file. Every optional field has a default so
//! a partial file (or no file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub locked_files: LockedFilesConfig,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub log: LogConfig,
}

/// How files held open by other processes are acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedFileStrategy {
    /// Give up on the first permission error
    Skip,
    /// Retry the direct copy, no fallbacks
    Retry,
    /// Retry, then stream the file in shared-read mode
    SharedMode,
    /// Retry, then try a volume snapshot, then shared-read
    Snapshot,
    /// Use the individual flags as configured
    Auto,
}

/// Named bundles of locked-file settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPreset {
    Fast,
    Balanced,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedFilesConfig {
    #[serde(default = "default_strategy")]
    pub strategy: LockedFileStrategy,

    /// Total direct-copy attempts before falling back
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts, in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,

    #[serde(default = "default_true")]
    pub use_shared_mode: bool,

    /// Volume snapshot copy. Never available, see `transfer::snapshot`.
    #[serde(default)]
    pub use_snapshot: bool,

    /// Skip paging files, registry hives, lock files and the like
    #[serde(default = "default_true")]
    pub skip_system_files: bool,

    #[serde(default = "default_true")]
    pub log_skipped_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Archive format used when a request does not name one
    #[serde(default = "default_format")]
    pub default_format: String,

    /// Compression level (1-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default)]
    pub incremental_by_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Concrete fallback-chain parameters, resolved once before a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub use_snapshot: bool,
    pub use_shared_mode: bool,
    pub skip_system_files: bool,
    pub log_skipped_files: bool,
}

// Default values
fn default_strategy() -> LockedFileStrategy {
    LockedFileStrategy::Auto
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_format() -> String {
    "zip".to_string()
}

fn default_compression_level() -> u32 {
    6
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LockedFilesConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            use_shared_mode: true,
            use_snapshot: false,
            skip_system_files: true,
            log_skipped_files: true,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            default_format: default_format(),
            compression_level: default_compression_level(),
            incremental_by_default: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LockedFilesConfig {
    /// Resolve the strategy tag and flags into the parameters the copier runs with.
    pub fn resolve(&self) -> CopyPolicy {
        let retry_delay =
            Duration::try_from_secs_f64(self.retry_delay.max(0.0)).unwrap_or(Duration::ZERO);
        let max_retries = self.max_retries.max(1);

        let (max_retries, use_snapshot, use_shared_mode) = match self.strategy {
            LockedFileStrategy::Skip => (1, false, false),
            LockedFileStrategy::Retry => (max_retries, false, false),
            LockedFileStrategy::SharedMode => (max_retries, false, true),
            LockedFileStrategy::Snapshot => (max_retries, true, self.use_shared_mode),
            LockedFileStrategy::Auto => (max_retries, self.use_snapshot, self.use_shared_mode),
        };

        CopyPolicy {
            max_retries,
            retry_delay,
            use_snapshot,
            use_shared_mode,
            skip_system_files: self.skip_system_files,
            log_skipped_files: self.log_skipped_files,
        }
    }
}

impl Default for CopyPolicy {
    fn default() -> Self {
        LockedFilesConfig::default().resolve()
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overwrite the locked-file settings with a preset
    pub fn apply_preset(&mut self, preset: BackupPreset) {
        let lf = &mut self.locked_files;
        match preset {
            BackupPreset::Fast => {
                lf.strategy = LockedFileStrategy::Skip;
                lf.max_retries = 1;
                lf.retry_delay = 0.1;
                lf.use_shared_mode = false;
                lf.use_snapshot = false;
            }
            BackupPreset::Balanced => {
                lf.strategy = LockedFileStrategy::Auto;
                lf.max_retries = 3;
                lf.retry_delay = 0.5;
                lf.use_shared_mode = true;
                lf.use_snapshot = false;
            }
            BackupPreset::Complete => {
                lf.strategy = LockedFileStrategy::Auto;
                lf.max_retries = 5;
                lf.retry_delay = 1.0;
                lf.use_shared_mode = true;
                lf.use_snapshot = true;
            }
        }
    }

    pub fn copy_policy(&self) -> CopyPolicy {
        self.locked_files.resolve()
    }
}
