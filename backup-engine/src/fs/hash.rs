//! Content hashing for change detection.

use crate::transfer::copier::SourceOpener;
use md5::{Digest, Md5};
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

/// Read size for streaming a file through the digest
pub const HASH_CHUNK_SIZE: usize = 4096;

/// Stored in place of a digest when the file could not be read.
/// Never compares equal to a real digest, including itself.
pub const UNKNOWN_DIGEST: &str = "unknown";

/// Hex MD5 digest of everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buffer = [0u8; HASH_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file opened through `opener`, returning None (and logging) when it
/// cannot be read.
///
/// A failed hash must not abort a backup run.
pub fn hash_file(path: &Path, opener: &dyn SourceOpener) -> Option<String> {
    let file = match opener.open_source(path) {
        Ok(file) => file,
        Err(reason) => {
            warn!("Failed to open {} for hashing: {}", path.display(), reason);
            return None;
        }
    };

    match hash_reader(file) {
        Ok(digest) => Some(digest),
        Err(e) => {
            warn!("Failed to hash {}: {}", path.display(), e);
            None
        }
    }
}

/// True when two digests denote the same content.
pub fn digests_match(stored: Option<&str>, current: &str) -> bool {
    match stored {
        Some(stored) => stored != UNKNOWN_DIGEST && current != UNKNOWN_DIGEST && stored == current,
        None => false,
    }
}
