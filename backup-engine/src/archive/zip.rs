//! ZIP archives (Deflate).

use super::{entry_name, open_entry, remove_on_error, safe_join, ArchiveCodec, ArchiveEntry, WriteReport};
use crate::transfer::copier::SourceOpener;
use crate::transfer::progress::{PhaseProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entries at least this large need ZIP64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

pub struct ZipCodec {
    level: u32,
}

impl ZipCodec {
    pub fn new(level: u32) -> Self {
        Self { level }
    }

    fn options_for(&self, size: u64) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.level as i64))
            .large_file(size >= ZIP64_THRESHOLD)
    }

    fn write_entries(
        &self,
        files: &[PathBuf],
        source_root: &Path,
        output: &Path,
        opener: &dyn SourceOpener,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        let mut zip = ZipWriter::new(BufWriter::new(File::create(output)?));
        let mut phase = PhaseProgress::new(progress, "Compressing", files.len());
        let mut report = WriteReport::default();

        for path in files {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let name = entry_name(path, source_root);
            if let Some(mut source) = open_entry(opener, path, &mut report) {
                let size = source.metadata()?.len();
                zip.start_file(name.as_str(), self.options_for(size))?;
                io::copy(&mut source, &mut zip)?;
                debug!("Added {} ({} bytes)", name, size);
                report.written.push(path.clone());
            }

            phase.advance(&name);
        }

        zip.finish()?.flush()?;
        Ok(report)
    }
}

impl ArchiveCodec for ZipCodec {
    fn write(
        &self,
        files: &[PathBuf],
        source_root: &Path,
        output: &Path,
        opener: &dyn SourceOpener,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        remove_on_error(output, || {
            self.write_entries(files, source_root, output, opener, progress, cancel)
        })
    }

    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>> {
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        let mut entries = Vec::with_capacity(zip.len());

        for i in 0..zip.len() {
            let entry = zip.by_index(i)?;
            entries.push(ArchiveEntry {
                name: entry.name().trim_end_matches('/').to_string(),
                size: entry.size(),
                is_dir: entry.is_dir(),
            });
        }

        Ok(entries)
    }

    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        let total = zip.len();
        let mut phase = PhaseProgress::new(progress, "Extracting", total);
        let mut extracted = 0;

        for i in 0..total {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut entry = zip.by_index(i)?;
            let name = entry.name().to_string();

            let Some(out_path) = safe_join(destination, &name) else {
                warn!("Skipping unsafe zip entry: {}", name);
                phase.advance(&name);
                continue;
            };

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
            } else {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = BufWriter::new(File::create(&out_path)?);
                io::copy(&mut entry, &mut out)?;
                out.flush()?;
            }

            extracted += 1;
            phase.advance(&name);
        }

        Ok(extracted)
    }
}
