//! Constants for the download module (timeouts, redirect and debounce limits).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Delay before a coalesced progress notification is emitted.
pub const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(200);

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;

/// Upper bound for problem-document bodies read into memory.
pub const MAX_PROBLEM_DOCUMENT_BYTES: usize = 64 * 1024;
