//! Compressed tarballs: `.tar.gz` (flate2) and `.tar.bz2` (bzip2).

use super::{entry_name, open_entry, remove_on_error, ArchiveCodec, ArchiveEntry, WriteReport};
use crate::transfer::copier::SourceOpener;
use crate::transfer::progress::{PhaseProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use ::tar::{Archive, Builder};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
    Bzip2,
}

pub struct TarCodec {
    compression: Compression,
    level: u32,
}

impl TarCodec {
    pub fn gzip(level: u32) -> Self {
        Self {
            compression: Compression::Gzip,
            level,
        }
    }

    pub fn bzip2(level: u32) -> Self {
        Self {
            compression: Compression::Bzip2,
            level,
        }
    }

    fn open_reader(&self, archive: &Path) -> Result<Archive<Box<dyn Read>>> {
        let file = BufReader::new(File::open(archive)?);
        let decoder: Box<dyn Read> = match self.compression {
            Compression::Gzip => Box::new(GzDecoder::new(file)),
            Compression::Bzip2 => Box::new(BzDecoder::new(file)),
        };
        Ok(Archive::new(decoder))
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
        let file = BufWriter::new(File::create(output)?);
        let mut report = WriteReport::default();

        match self.compression {
            Compression::Gzip => {
                let encoder = GzEncoder::new(file, flate2::Compression::new(self.level));
                let encoder =
                    append_entries(encoder, files, source_root, opener, &mut report, progress, cancel)?;
                encoder.finish()?.flush()?;
            }
            Compression::Bzip2 => {
                let encoder = BzEncoder::new(file, bzip2::Compression::new(self.level));
                let encoder =
                    append_entries(encoder, files, source_root, opener, &mut report, progress, cancel)?;
                encoder.finish()?.flush()?;
            }
        }

        Ok(report)
    }
}

/// Append every file to a tar stream over `writer` and hand the writer back
fn append_entries<W: Write>(
    writer: W,
    files: &[PathBuf],
    source_root: &Path,
    opener: &dyn SourceOpener,
    report: &mut WriteReport,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<W> {
    let mut builder = Builder::new(writer);
    let mut phase = PhaseProgress::new(progress, "Compressing", files.len());

    for path in files {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let name = entry_name(path, source_root);
        if let Some(mut source) = open_entry(opener, path, report) {
            builder.append_file(&name, &mut source)?;
            debug!("Added {}", name);
            report.written.push(path.clone());
        }

        phase.advance(&name);
    }

    Ok(builder.into_inner()?)
}

impl ArchiveCodec for TarCodec {
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
        let mut tar = self.open_reader(archive)?;
        let mut entries = Vec::new();

        for entry in tar.entries()? {
            let entry = entry?;
            let header = entry.header();
            entries.push(ArchiveEntry {
                name: entry
                    .path()?
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string(),
                size: header.size()?,
                is_dir: header.entry_type().is_dir(),
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
        // Compressed streams cannot seek, so count entries in a first pass
        let total = self.list(archive)?.len();
        let mut phase = PhaseProgress::new(progress, "Extracting", total);

        let mut extracted = 0;
        let mut tar = self.open_reader(archive)?;
        for entry in tar.entries()? {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().to_string();

            // unpack_in refuses entries that would land outside `destination`
            if entry.unpack_in(destination)? {
                extracted += 1;
            } else {
                warn!("Skipping unsafe tar entry: {}", name);
            }

            phase.advance(&name);
        }

        Ok(extracted)
    }
}
