//! File system helpers: traversal, hashing, metadata and the system-file filter.

pub mod filter;
pub mod hash;
pub mod metadata;
pub mod walker;

pub use filter::should_skip_file;
pub use hash::{hash_file, UNKNOWN_DIGEST};
pub use walker::{walk_directory, FileInfo, WalkOptions};
