//! Logging infrastructure for Loopfs
//!
//! Structured logging goes through `tracing` when the `logging` feature is
//! enabled; the macros below compile to nothing otherwise.
//!
//! # Log Levels
//!
//! - **WARN**: Worker death, protocol errors from a worker
//! - **INFO**: Driver selection
//! - **DEBUG**: File open/close, worker acquisition and eviction
//! - **TRACE**: Status cache hits, misses and invalidations
//!
//! Paths are user-controlled; pass them through [`sanitize_for_log`] so a
//! crafted file name cannot forge log lines.

use std::borrow::Cow;
use std::path::Path;

/// Maximum length of a logged value before truncation.
const MAX_VALUE_LENGTH: usize = 200;

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_trace {
    ($($arg:tt)*) => {};
}

pub(crate) use {log_debug, log_info, log_trace, log_warn};

/// Sanitize a value for logging.
///
/// Escapes characters that could be used for log injection and truncates
/// long values on a char boundary.
pub fn sanitize_for_log(input: &str) -> String {
    let escaped: String = input
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .collect();
    truncate(&escaped).into_owned()
}

/// Sanitize a path for logging.
pub fn display_path(path: &Path) -> String {
    sanitize_for_log(&path.to_string_lossy())
}

fn truncate(value: &str) -> Cow<'_, str> {
    if value.len() <= MAX_VALUE_LENGTH {
        return Cow::Borrowed(value);
    }
    let mut end = MAX_VALUE_LENGTH;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{}...[truncated {} bytes]",
        &value[..end],
        value.len() - end
    ))
}
