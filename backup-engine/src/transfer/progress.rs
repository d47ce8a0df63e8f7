//! Progress reporting for scans, archive writes, extraction and copies.
//!
//! Every phase reports `(percentage, message)` pairs to a [`ProgressSink`].
//! Phases restart at 0, so values are not monotonic across a whole backup.

/// Longest file label included in a progress message, in characters
pub const MAX_LABEL_CHARS: usize = 50;

/// Receiver of progress updates from the engine
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percentage: u8, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn on_progress(&self, percentage: u8, message: &str) {
        self(percentage, message)
    }
}

/// Sink that drops every update
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _percentage: u8, _message: &str) {}
}

/// Integer percentage of `current` over `total`, 0 when `total` is 0
pub fn percent(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current.min(total) as u128 * 100) / total as u128) as u8
}

/// Truncate a label to [`MAX_LABEL_CHARS`] characters
pub fn truncate_label(label: &str) -> &str {
    match label.char_indices().nth(MAX_LABEL_CHARS) {
        Some((idx, _)) => &label[..idx],
        None => label,
    }
}

/// Tracks one phase (scan, compress, extract, copy) over a known number of items
pub struct PhaseProgress<'a> {
    sink: &'a dyn ProgressSink,
    verb: &'static str,
    total: usize,
    processed: usize,
}

impl<'a> PhaseProgress<'a> {
    pub fn new(sink: &'a dyn ProgressSink, verb: &'static str, total: usize) -> Self {
        Self {
            sink,
            verb,
            total,
            processed: 0,
        }
    }

    /// Mark one more item done and report it
    pub fn advance(&mut self, label: &str) {
        self.processed += 1;
        self.sink.on_progress(
            percent(self.processed, self.total),
            &format!("{}: {}...", self.verb, truncate_label(label)),
        );
    }

    pub fn processed(&self) -> usize {
        self.processed
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
