//! Archive creation and extraction.
//!
//! Each supported format implements [`ArchiveCodec`]. Entries are named by
//! their `/`-separated path relative to the backup source root.

pub mod sevenz;
pub mod tar;
pub mod zip;

use crate::transfer::copier::SourceOpener;
use crate::transfer::progress::ProgressSink;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "7z")]
    SevenZ,
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.bz2")]
    TarBz2,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 4] = [
        ArchiveFormat::Zip,
        ArchiveFormat::SevenZ,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarBz2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::SevenZ => "7z",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        }
    }

    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::SevenZ => ".7z",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarBz2 => ".tar.bz2",
        }
    }

    /// Detect the format of an existing archive from its file name
    pub fn from_archive_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        Self::ALL
            .into_iter()
            .find(|format| name.ends_with(format.extension()))
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "unrecognized backup format: {}",
                    path.display()
                ))
            })
    }

    /// Codec for this format at the given compression level (1-9)
    pub fn codec(&self, compression_level: u32) -> Box<dyn ArchiveCodec> {
        let level = compression_level.clamp(1, 9);
        match self {
            ArchiveFormat::Zip => Box::new(self::zip::ZipCodec::new(level)),
            ArchiveFormat::SevenZ => Box::new(self::sevenz::SevenZCodec),
            ArchiveFormat::TarGz => Box::new(self::tar::TarCodec::gzip(level)),
            ArchiveFormat::TarBz2 => Box::new(self::tar::TarCodec::bzip2(level)),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(|f| f.as_str()).collect();
                EngineError::Config(format!(
                    "unsupported format {}, use: {}",
                    s,
                    supported.join(", ")
                ))
            })
    }
}

/// An entry listed from an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// What an archive write stored and what it had to leave out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Files stored, in archive order
    pub written: Vec<PathBuf>,
    /// Files that could not be opened, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Reading and writing one archive format
pub trait ArchiveCodec: Send + Sync {
    /// Write `files` into a new archive at `output`, in order, each named by
    /// its path relative to `source_root`. Sources are opened through
    /// `opener`; files it cannot open are left out and reported. A cancelled
    /// or failed write leaves no file behind.
    fn write(
        &self,
        files: &[PathBuf],
        source_root: &Path,
        output: &Path,
        opener: &dyn SourceOpener,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<WriteReport>;

    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>>;

    /// Restore entries under `destination`, returning how many were written.
    /// Entries whose names would escape `destination` are skipped.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<usize>;
}

/// Archive entry name for `path`: relative to `root`, `/`-separated
pub fn entry_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    crate::fs::walker::relative_key(relative)
}

/// Resolve an entry name under `destination`, refusing names that would
/// escape it (absolute paths, `..`)
pub fn safe_join(destination: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    let mut out = destination.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out == destination {
        return None;
    }
    Some(out)
}

/// Open one archive source, recording it in `report` when it cannot be read
pub(crate) fn open_entry(
    opener: &dyn SourceOpener,
    path: &Path,
    report: &mut WriteReport,
) -> Option<File> {
    match opener.open_source(path) {
        Ok(file) => Some(file),
        Err(reason) => {
            warn!("Leaving {} out of the archive: {}", path.display(), reason);
            report.skipped.push((path.to_path_buf(), reason));
            None
        }
    }
}

/// Run a write, removing the partial archive if it fails or is cancelled
pub(crate) fn remove_on_error<T, F>(output: &Path, write: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let result = write();
    if result.is_err() && output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            warn!("Failed to remove partial archive {}: {}", output.display(), e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyPolicy;
    use crate::transfer::copier::ResilientCopier;
    use crate::transfer::progress::NoProgress;
    use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn opener() -> ResilientCopier {
        ResilientCopier::new(CopyPolicy {
            retry_delay: Duration::ZERO,
            ..CopyPolicy::default()
        })
    }

    /// Refuses to open files whose name ends with the given suffix
    struct RefusingOpener(&'static str);

    impl SourceOpener for RefusingOpener {
        fn open_source(&self, src: &Path) -> std::result::Result<File, String> {
            if src.to_string_lossy().ends_with(self.0) {
                return Err("permission denied: file is locked".to_string());
            }
            File::open(src).map_err(|e| e.to_string())
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("zip".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert_eq!("7z".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::SevenZ);
        assert_eq!("tar.gz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!("tar.bz2".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarBz2);

        let err = "rar".parse::<ArchiveFormat>().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("zip, 7z, tar.gz, tar.bz2"));
    }

    #[test]
    fn test_format_from_archive_path() {
        let detect = |name: &str| ArchiveFormat::from_archive_path(Path::new(name));
        assert_eq!(detect("docs_full_20240101_120000.zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(detect("/b/x.7z").unwrap(), ArchiveFormat::SevenZ);
        assert_eq!(detect("x.TAR.GZ").unwrap(), ArchiveFormat::TarGz);
        assert_eq!(detect("x.tar.bz2").unwrap(), ArchiveFormat::TarBz2);
        assert!(matches!(detect("x.rar"), Err(EngineError::Config(_))));
        assert!(matches!(detect("x.gz"), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_format_serde_names() {
        let json = serde_json::to_string(&ArchiveFormat::TarBz2).unwrap();
        assert_eq!(json, "\"tar.bz2\"");
        let back: ArchiveFormat = serde_json::from_str("\"7z\"").unwrap();
        assert_eq!(back, ArchiveFormat::SevenZ);
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let dest = Path::new("/restore");
        assert_eq!(safe_join(dest, "a/b.txt"), Some(PathBuf::from("/restore/a/b.txt")));
        assert_eq!(safe_join(dest, "./a.txt"), Some(PathBuf::from("/restore/a.txt")));
        assert_eq!(safe_join(dest, "../etc/passwd"), None);
        assert_eq!(safe_join(dest, "/etc/passwd"), None);
        assert_eq!(safe_join(dest, "."), None);
    }

    fn sample_tree() -> (TempDir, Vec<PathBuf>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("c/deep")).unwrap();
        let files = vec![
            ("a.txt", b"aaaaaaaaaa".to_vec()),
            ("b.txt", b"bbbbbbbbbbbbbbbbbbbb".to_vec()),
            ("c/d.txt", b"ddddd".to_vec()),
            ("c/deep/e.bin", (0..5000u32).map(|i| (i % 7) as u8).collect()),
        ];
        let mut paths = Vec::new();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::write(&path, content).unwrap();
            paths.push(path);
        }
        (dir, paths)
    }

    #[test]
    fn test_round_trip_every_format() {
        for format in ArchiveFormat::ALL {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let restore = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("backup{}", format.extension()));
            let codec = format.codec(6);
            let cancel = CancellationToken::new();

            let report = codec
                .write(&files, source.path(), &archive, &opener(), &NoProgress, &cancel)
                .unwrap_or_else(|e| panic!("{} write failed: {}", format, e));
            assert_eq!(report.written, files, "{}", format);
            assert!(report.skipped.is_empty());

            let mut names: Vec<String> = codec
                .list(&archive)
                .unwrap()
                .into_iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.name)
                .collect();
            names.sort();
            assert_eq!(
                names,
                vec!["a.txt", "b.txt", "c/d.txt", "c/deep/e.bin"],
                "{} listing",
                format
            );

            let count = codec
                .extract(&archive, restore.path(), &NoProgress, &cancel)
                .unwrap_or_else(|e| panic!("{} extract failed: {}", format, e));
            assert_eq!(count, files.len(), "{}", format);

            for file in &files {
                let rel = file.strip_prefix(source.path()).unwrap();
                let restored = fs::read(restore.path().join(rel)).unwrap();
                assert_eq!(restored, fs::read(file).unwrap(), "{} {:?}", format, rel);
            }
        }
    }

    #[test]
    fn test_write_progress_per_entry() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz, ArchiveFormat::SevenZ] {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("p{}", format.extension()));

            let seen = Mutex::new(Vec::new());
            let sink = |pct: u8, msg: &str| seen.lock().unwrap().push((pct, msg.to_string()));
            format
                .codec(6)
                .write(
                    &files,
                    source.path(),
                    &archive,
                    &opener(),
                    &sink,
                    &CancellationToken::new(),
                )
                .unwrap();

            let seen = seen.into_inner().unwrap();
            assert_eq!(seen.len(), files.len(), "{}", format);
            assert_eq!(seen.last().unwrap().0, 100);
            assert_eq!(seen[0].1, "Compressing: a.txt...");
        }
    }

    #[test]
    fn test_cancelled_write_leaves_no_archive() {
        for format in ArchiveFormat::ALL {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("c{}", format.extension()));
            let cancel = CancellationToken::new();
            cancel.cancel();

            let result = format
                .codec(6)
                .write(&files, source.path(), &archive, &opener(), &NoProgress, &cancel);

            assert!(matches!(result, Err(EngineError::Cancelled)), "{}", format);
            assert!(!archive.exists(), "{}", format);
        }
    }

    #[test]
    fn test_empty_file_round_trip() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::TarGz, ArchiveFormat::TarBz2] {
            let source = TempDir::new().unwrap();
            let empty = source.path().join("empty.txt");
            fs::write(&empty, b"").unwrap();

            let out_dir = TempDir::new().unwrap();
            let restore = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("e{}", format.extension()));
            let codec = format.codec(6);
            let cancel = CancellationToken::new();

            codec
                .write(&[empty], source.path(), &archive, &opener(), &NoProgress, &cancel)
                .unwrap();
            let count = codec
                .extract(&archive, restore.path(), &NoProgress, &cancel)
                .unwrap();

            assert_eq!(count, 1, "{}", format);
            assert_eq!(fs::read(restore.path().join("empty.txt")).unwrap(), b"");
        }
    }

    #[test]
    fn test_extract_progress_per_entry() {
        for format in ArchiveFormat::ALL {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let restore = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("x{}", format.extension()));
            let codec = format.codec(6);
            let cancel = CancellationToken::new();
            codec
                .write(&files, source.path(), &archive, &opener(), &NoProgress, &cancel)
                .unwrap();

            let seen = Mutex::new(Vec::new());
            let sink = |pct: u8, msg: &str| seen.lock().unwrap().push((pct, msg.to_string()));
            codec.extract(&archive, restore.path(), &sink, &cancel).unwrap();

            let seen = seen.into_inner().unwrap();
            assert_eq!(seen.len(), files.len(), "{}", format);
            assert_eq!(seen[0], (25, "Extracting: a.txt...".to_string()), "{}", format);
            assert_eq!(seen.last().unwrap().0, 100, "{}", format);
        }
    }

    #[test]
    fn test_cancelled_extract() {
        for format in ArchiveFormat::ALL {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let restore = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("x{}", format.extension()));
            let codec = format.codec(6);
            codec
                .write(
                    &files,
                    source.path(),
                    &archive,
                    &opener(),
                    &NoProgress,
                    &CancellationToken::new(),
                )
                .unwrap();

            let cancel = CancellationToken::new();
            cancel.cancel();
            let result = codec.extract(&archive, restore.path(), &NoProgress, &cancel);

            assert!(matches!(result, Err(EngineError::Cancelled)), "{}", format);
            assert!(!restore.path().join("a.txt").exists(), "{}", format);
        }
    }

    #[test]
    fn test_sevenz_extract_stays_inside_destination() {
        let root = TempDir::new().unwrap();
        let payload = root.path().join("payload.txt");
        fs::write(&payload, b"escape attempt").unwrap();
        fs::write(root.path().join("inner.txt"), b"fine").unwrap();

        let archive = root.path().join("evil.7z");
        let mut writer = SevenZWriter::create(&archive).unwrap();
        writer
            .push_archive_entry(
                SevenZArchiveEntry::from_path(&payload, "../escaped.txt".to_string()),
                Some(File::open(&payload).unwrap()),
            )
            .unwrap();
        writer
            .push_archive_entry(
                SevenZArchiveEntry::from_path(root.path().join("inner.txt"), "inner.txt".to_string()),
                Some(File::open(root.path().join("inner.txt")).unwrap()),
            )
            .unwrap();
        writer.finish().unwrap();

        let restore = root.path().join("restore");
        fs::create_dir(&restore).unwrap();
        let count = ArchiveFormat::SevenZ
            .codec(6)
            .extract(&archive, &restore, &NoProgress, &CancellationToken::new())
            .unwrap();

        assert_eq!(count, 1);
        assert!(!root.path().join("escaped.txt").exists());
        assert_eq!(fs::read(restore.join("inner.txt")).unwrap(), b"fine");
    }

    #[test]
    fn test_zip_extract_stays_inside_destination() {
        let root = TempDir::new().unwrap();
        let archive = root.path().join("evil.zip");
        {
            let mut zip = ::zip::ZipWriter::new(File::create(&archive).unwrap());
            let options = ::zip::write::SimpleFileOptions::default();
            zip.start_file("../escaped.txt", options).unwrap();
            std::io::Write::write_all(&mut zip, b"escape attempt").unwrap();
            zip.start_file("inner.txt", options).unwrap();
            std::io::Write::write_all(&mut zip, b"fine").unwrap();
            zip.finish().unwrap();
        }

        let restore = root.path().join("restore");
        fs::create_dir(&restore).unwrap();
        let count = ArchiveFormat::Zip
            .codec(6)
            .extract(&archive, &restore, &NoProgress, &CancellationToken::new())
            .unwrap();

        assert_eq!(count, 1);
        assert!(!root.path().join("escaped.txt").exists());
        assert_eq!(fs::read(restore.join("inner.txt")).unwrap(), b"fine");
    }

    #[test]
    fn test_unopenable_source_is_left_out() {
        for format in ArchiveFormat::ALL {
            let (source, files) = sample_tree();
            let out_dir = TempDir::new().unwrap();
            let restore = TempDir::new().unwrap();
            let archive = out_dir.path().join(format!("s{}", format.extension()));
            let codec = format.codec(6);
            let cancel = CancellationToken::new();

            let seen = Mutex::new(Vec::new());
            let sink = |pct: u8, _: &str| seen.lock().unwrap().push(pct);
            let report = codec
                .write(
                    &files,
                    source.path(),
                    &archive,
                    &RefusingOpener("b.txt"),
                    &sink,
                    &cancel,
                )
                .unwrap_or_else(|e| panic!("{} write failed: {}", format, e));

            assert_eq!(report.written.len(), 3, "{}", format);
            assert_eq!(report.skipped.len(), 1, "{}", format);
            assert!(report.skipped[0].0.ends_with("b.txt"));
            assert!(report.skipped[0].1.contains("locked"));
            // Skipped files still advance progress
            assert_eq!(seen.into_inner().unwrap().len(), files.len());

            let count = codec
                .extract(&archive, restore.path(), &NoProgress, &cancel)
                .unwrap();
            assert_eq!(count, 3, "{}", format);
            assert!(!restore.path().join("b.txt").exists(), "{}", format);
            assert_eq!(fs::read(restore.path().join("a.txt")).unwrap(), b"aaaaaaaaaa");
        }
    }

    #[test]
    fn test_entry_name() {
        let root = Path::new("/src");
        assert_eq!(entry_name(Path::new("/src/c/d.txt"), root), "c/d.txt");
    }
}
