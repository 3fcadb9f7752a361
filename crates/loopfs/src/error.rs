//! Error types for Loopfs
//!
//! Every backend failure is folded into one of a small number of kinds so
//! callers can react the same way whichever execution strategy is active:
//! - `Closed` when the handle was closed (or the OS reports a bad descriptor)
//! - `Stream` for I/O failures on an open handle
//! - `PendingOperation` when a call breaks the handle's admission rules
//! - `Filesystem` for whole-path calls outside the per-handle queue
//! - `Cancelled` when a read was cancelled before it completed

use std::io;

use thiserror::Error;

/// Result type alias using Loopfs's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Loopfs error types.
#[derive(Error, Debug)]
pub enum Error {
    /// The handle is closed, is closing, or the OS reported a bad descriptor.
    #[error("the file handle is closed")]
    Closed,

    /// Generic I/O failure on an open handle.
    #[error("stream error: {0}")]
    Stream(String),

    /// The call was refused by the handle's admission rules.
    #[error("pending operation: {0}")]
    PendingOperation(&'static str),

    /// Failure of a whole-path operation (open, stat, delete, ...).
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// A read was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The open mode string could not be parsed.
    #[error("invalid open mode: {0}")]
    InvalidMode(String),

    /// Configuration could not be loaded or applied.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error raised by an operation on an open handle.
    ///
    /// A bad descriptor means the handle raced with a close, which callers
    /// see as `Closed` rather than a generic stream failure.
    pub(crate) fn stream(err: io::Error) -> Self {
        if is_bad_descriptor(&err) {
            return Self::Closed;
        }
        Self::Stream(err.to_string())
    }

    /// Wrap an I/O error raised by a whole-path operation.
    pub(crate) fn filesystem(action: &str, path: &std::path::Path, err: io::Error) -> Self {
        Self::Filesystem(format!("{action} {}: {err}", path.display()))
    }

    /// Whether this error is the `Closed` kind.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether this error is the `PendingOperation` kind.
    pub fn is_pending_operation(&self) -> bool {
        matches!(self, Self::PendingOperation(_))
    }
}

#[cfg(unix)]
fn is_bad_descriptor(err: &io::Error) -> bool {
    // EBADF has the same value on every supported unix.
    const EBADF: i32 = 9;
    err.raw_os_error() == Some(EBADF)
}

#[cfg(not(unix))]
fn is_bad_descriptor(_err: &io::Error) -> bool {
    false
}
