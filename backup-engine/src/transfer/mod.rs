//! File acquisition: locked-file tolerant copying and progress reporting.

pub mod copier;
pub mod progress;
pub mod snapshot;

pub use copier::{
    CopyOutcome, CopyState, CopyStrategy, CopySummary, FileAccess, PlatformAccess, ResilientCopier,
    SourceOpener,
};
pub use progress::{NoProgress, ProgressSink};
