//! Change detection: decide which source files go into the next archive.

use super::manifest::MetadataStore;
use crate::fs::hash::{digests_match, hash_file, UNKNOWN_DIGEST};
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::transfer::copier::SourceOpener;
use crate::transfer::progress::{PhaseProgress, ProgressSink};
use crate::utils::errors::{EngineError, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Walk `source_dir` and return the files to archive, in walk order.
///
/// Full mode selects everything. Incremental mode selects files whose path
/// is new to `store` or whose digest changed. Either way the stored digest
/// of every visited file is overwritten with the one just computed. Files
/// `opener` cannot read get [`UNKNOWN_DIGEST`] and are always selected.
pub fn select_files(
    source_dir: &Path,
    incremental: bool,
    store: &mut MetadataStore,
    walk_options: &WalkOptions,
    opener: &dyn SourceOpener,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<Vec<FileInfo>> {
    // Enumerate first so progress has a denominator
    let files = walk_directory(source_dir, walk_options)?;
    let total = files.len();
    let mut phase = PhaseProgress::new(progress, "Scanning", total);
    let mut selected = Vec::new();

    for file in files {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let key = file.relative_key();
        phase.advance(&key);

        let digest = hash_file(&file.path, opener).unwrap_or_else(|| UNKNOWN_DIGEST.to_string());

        let changed = !incremental || !digests_match(store.files.get(&key).map(String::as_str), &digest);
        if changed {
            debug!("Selected {}", key);
        }

        store.files.insert(key, digest);
        if changed {
            selected.push(file);
        }
    }

    info!(
        "Scanned {} files in {}, {} selected ({})",
        total,
        source_dir.display(),
        selected.len(),
        if incremental { "incremental" } else { "full" }
    );

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyPolicy;
    use crate::transfer::copier::ResilientCopier;
    use crate::transfer::progress::NoProgress;
    use std::fs::{self, File};
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

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("c")).unwrap();
        fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::write(dir.path().join("b.txt"), b"01234567890123456789").unwrap();
        fs::write(dir.path().join("c/d.txt"), b"01234").unwrap();
        dir
    }

    fn scan(dir: &Path, incremental: bool, store: &mut MetadataStore) -> Vec<String> {
        select_files(
            dir,
            incremental,
            store,
            &WalkOptions::default(),
            &opener(),
            &NoProgress,
            &CancellationToken::new(),
        )
        .unwrap()
        .into_iter()
        .map(|f| f.relative_key())
        .collect()
    }

    #[test]
    fn test_full_scan_selects_everything_and_records_hashes() {
        let dir = tree();
        let mut store = MetadataStore::default();

        let selected = scan(dir.path(), false, &mut store);

        assert_eq!(selected, vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(store.files.len(), 3);
        assert!(store.files.values().all(|h| h.len() == 32));

        // Full mode ignores history
        assert_eq!(scan(dir.path(), false, &mut store).len(), 3);
    }

    #[test]
    fn test_incremental_selects_only_changes() {
        let dir = tree();
        let mut store = MetadataStore::default();

        assert_eq!(scan(dir.path(), true, &mut store).len(), 3);
        assert!(scan(dir.path(), true, &mut store).is_empty());

        fs::write(dir.path().join("a.txt"), b"changed!!!").unwrap();
        fs::write(dir.path().join("new.txt"), b"brand new").unwrap();

        assert_eq!(scan(dir.path(), true, &mut store), vec!["a.txt", "new.txt"]);
        assert!(scan(dir.path(), true, &mut store).is_empty());
    }

    #[test]
    fn test_stale_paths_are_kept() {
        let dir = tree();
        let mut store = MetadataStore::default();
        scan(dir.path(), true, &mut store);

        fs::remove_file(dir.path().join("b.txt")).unwrap();
        scan(dir.path(), true, &mut store);

        assert!(store.files.contains_key("b.txt"));
    }

    #[test]
    fn test_unknown_digest_is_always_selected() {
        let dir = tree();
        let mut store = MetadataStore::default();
        scan(dir.path(), true, &mut store);

        store
            .files
            .insert("a.txt".to_string(), UNKNOWN_DIGEST.to_string());

        assert_eq!(scan(dir.path(), true, &mut store), vec!["a.txt"]);
        assert_ne!(store.files["a.txt"], UNKNOWN_DIGEST);
    }

    #[test]
    fn test_unopenable_file_does_not_abort_scan() {
        let dir = tree();
        let mut store = MetadataStore::default();
        let refusing = RefusingOpener("b.txt");

        let scan_with = |store: &mut MetadataStore, opener: &dyn SourceOpener| -> Vec<String> {
            select_files(
                dir.path(),
                true,
                store,
                &WalkOptions::default(),
                opener,
                &NoProgress,
                &CancellationToken::new(),
            )
            .unwrap()
            .into_iter()
            .map(|f| f.relative_key())
            .collect()
        };

        assert_eq!(scan_with(&mut store, &refusing), vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(store.files["b.txt"], UNKNOWN_DIGEST);

        // Still unreadable: reselected every time, the others are not
        assert_eq!(scan_with(&mut store, &refusing), vec!["b.txt"]);

        // Readable again: picked up once, then settled
        assert_eq!(scan_with(&mut store, &opener()), vec!["b.txt"]);
        assert!(scan_with(&mut store, &opener()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_on_disk() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tree();
        let locked = dir.path().join("b.txt");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through permission bits; nothing to check then
        if File::open(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
            return;
        }

        let mut store = MetadataStore::default();
        let selected = scan(dir.path(), true, &mut store);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(selected, vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(store.files["b.txt"], UNKNOWN_DIGEST);
        assert_ne!(store.files["a.txt"], UNKNOWN_DIGEST);
    }

    #[test]
    fn test_progress_per_file() {
        let dir = tree();
        let mut store = MetadataStore::default();
        let seen = Mutex::new(Vec::new());
        let sink = |pct: u8, msg: &str| seen.lock().unwrap().push((pct, msg.to_string()));

        select_files(
            dir.path(),
            false,
            &mut store,
            &WalkOptions::default(),
            &opener(),
            &sink,
            &CancellationToken::new(),
        )
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                (33, "Scanning: a.txt...".to_string()),
                (66, "Scanning: b.txt...".to_string()),
                (100, "Scanning: c/d.txt...".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_source() {
        let dir = TempDir::new().unwrap();
        let mut store = MetadataStore::default();
        assert!(scan(dir.path(), false, &mut store).is_empty());
    }

    #[test]
    fn test_cancellation() {
        let dir = tree();
        let mut store = MetadataStore::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = select_files(
            dir.path(),
            true,
            &mut store,
            &WalkOptions::default(),
            &opener(),
            &NoProgress,
            &cancel,
        );
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(store.files.is_empty());
    }
}
