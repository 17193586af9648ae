//! Canonical default values shared across the store, coordinator and worker.

pub const DEFAULT_STATE_STORE_URL: &str = "sqlite:scrivener.sqlite";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOCK_DURATION_SECS: u64 = 300;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 16;
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{workflow}-{date}";

/// Separator between a run id and a file index inside a fan-out job id.
pub const FAN_OUT_MARKER: &str = ":file:";

/// Per-file error messages are cut to this many characters before they are stored.
pub const PER_FILE_ERROR_MAX_CHARS: usize = 500;
/// Run-level error summaries are cut to this many characters.
pub const RUN_ERROR_MAX_CHARS: usize = 1000;

/// Rough characters-per-token ratio used for prompt size estimation.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;
