//! 7z archives via `sevenz-rust`.

use super::{
    entry_name, open_entry, remove_on_error, safe_join, ArchiveCodec, ArchiveEntry, WriteReport,
};
use crate::transfer::copier::SourceOpener;
use crate::transfer::progress::{PhaseProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use sevenz_rust::{Password, SevenZArchiveEntry, SevenZReader, SevenZWriter};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct SevenZCodec;

fn archive_error(e: sevenz_rust::Error) -> EngineError {
    EngineError::Archive(format!("7z: {}", e))
}

impl SevenZCodec {
    fn write_entries(
        &self,
        files: &[PathBuf],
        source_root: &Path,
        output: &Path,
        opener: &dyn SourceOpener,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        let mut writer = SevenZWriter::create(output).map_err(archive_error)?;
        let mut phase = PhaseProgress::new(progress, "Compressing", files.len());
        let mut report = WriteReport::default();

        for path in files {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let name = entry_name(path, source_root);
            if let Some(source) = open_entry(opener, path, &mut report) {
                let size = source.metadata()?.len();
                let entry = SevenZArchiveEntry::from_path(path, name.clone());

                // Empty files are stored without a data stream
                let reader = if size > 0 { Some(source) } else { None };
                writer
                    .push_archive_entry(entry, reader)
                    .map_err(archive_error)?;
                debug!("Added {} ({} bytes)", name, size);
                report.written.push(path.clone());
            }

            phase.advance(&name);
        }

        writer.finish()?;
        Ok(report)
    }
}

impl ArchiveCodec for SevenZCodec {
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
        let mut reader = SevenZReader::open(archive, Password::empty()).map_err(archive_error)?;
        let mut entries = Vec::new();

        reader
            .for_each_entries(|entry, data| {
                entries.push(ArchiveEntry {
                    name: entry.name().to_string(),
                    size: entry.size(),
                    is_dir: entry.is_directory(),
                });
                // Drain so the next entry starts at its own data
                io::copy(data, &mut io::sink())?;
                Ok(true)
            })
            .map_err(archive_error)?;

        Ok(entries)
    }

    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        // Entry count for progress needs a listing pass first
        let total = self.list(archive)?.len();
        let mut phase = PhaseProgress::new(progress, "Extracting", total);
        let mut extracted = 0;
        let mut cancelled = false;

        let mut reader = SevenZReader::open(archive, Password::empty()).map_err(archive_error)?;
        reader
            .for_each_entries(|entry, data| {
                if cancel.is_cancelled() {
                    cancelled = true;
                    return Ok(false);
                }

                let name = entry.name().to_string();
                let Some(out_path) = safe_join(destination, &name) else {
                    warn!("Skipping unsafe 7z entry: {}", name);
                    io::copy(data, &mut io::sink())?;
                    phase.advance(&name);
                    return Ok(true);
                };

                if entry.is_directory() {
                    fs::create_dir_all(&out_path)?;
                } else {
                    if let Some(parent) = out_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut out = BufWriter::new(File::create(&out_path)?);
                    io::copy(data, &mut out)?;
                    out.flush()?;
                }

                extracted += 1;
                phase.advance(&name);
                Ok(true)
            })
            .map_err(archive_error)?;

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(extracted)
    }
}
