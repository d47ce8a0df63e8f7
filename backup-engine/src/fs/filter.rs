//! A-priori filter for files that the OS keeps locked.

use std::path::Path;

/// Names (files or directories) that are always held open by the system
const SYSTEM_NAMES: &[&str] = &[
    "pagefile.sys",
    "hiberfil.sys",
    "swapfile.sys",
    "$recycle.bin",
    "system volume information",
    "ntuser.dat",
    "usrclass.dat",
];

/// Lock-file extensions
const LOCK_EXTENSIONS: &[&str] = &[".lock", ".lck"];

/// Whether a path should be skipped without attempting to copy it.
///
/// Matches case-insensitively against every path component, so files inside
/// `$Recycle.Bin` or `System Volume Information` are skipped too.
pub fn should_skip_file(path: &Path) -> bool {
    if let Some(name) = path.file_name() {
        let name = name.to_string_lossy().to_lowercase();
        if LOCK_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            return true;
        }
    }

    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy().to_lowercase();
        SYSTEM_NAMES.contains(&part.as_str())
    })
}
