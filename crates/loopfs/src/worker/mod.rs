//! Worker pool used by the delegated strategy.
//!
//! A worker hosts open files and executes [`FileTask`]s against them. Files
//! opened on a worker stay pinned to it until closed, so every task for a
//! handle goes to the same worker. The [`WorkerScheduler`] decides which
//! worker hosts a new file and bounds how many distinct workers do.
//!
//! Two worker flavors ship:
//! - [`ThreadWorker`]: a dedicated OS thread.
//! - [`ProcessWorker`]: a `loopfs-worker` child process speaking JSON lines
//!   (see [`protocol`]). A crash only takes the child down.

pub mod protocol;

mod pool;
mod process;
mod scheduler;
mod task;
mod thread;

pub use pool::{LocalWorkerPool, WorkerKind};
pub use process::ProcessWorker;
pub use protocol::serve;
pub use scheduler::{WorkerLease, WorkerScheduler};
pub use task::{FileTask, TaskOutcome, TaskRunner};
pub use thread::ThreadWorker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Process-unique worker identifier.
pub type WorkerId = u64;

pub(crate) fn next_worker_id() -> WorkerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Executes file tasks.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// False once the worker died. A dead worker never comes back.
    fn is_running(&self) -> bool;

    /// Run one task.
    ///
    /// When `cancel` fires before the worker answered, the call resolves
    /// with [`WorkerError::Cancelled`]; the task itself may still run.
    async fn execute(
        &self,
        task: FileTask,
        cancel: Option<CancellationToken>,
    ) -> Result<TaskOutcome, WorkerError>;
}

/// Hands out workers.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// A worker to host a new file. May return a worker already in use.
    async fn get_worker(&self) -> Result<Arc<dyn Worker>, WorkerError>;
}

/// Failure reported by a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The task ran and failed.
    #[error(transparent)]
    Task(RemoteError),

    /// The worker died before answering.
    #[error("worker exited")]
    Exited,

    /// The worker could not be reached or misbehaved.
    #[error("worker failure: {0}")]
    Failure(String),

    /// The caller stopped waiting.
    #[error("worker task cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Fold into the error kinds of an operation on an open handle.
    pub(crate) fn into_stream_error(self) -> Error {
        match self {
            Self::Task(remote) => remote.into(),
            Self::Cancelled => Error::Cancelled,
            other => Error::Stream(other.to_string()),
        }
    }

    /// Fold into the error kinds of a whole-path operation.
    pub(crate) fn into_filesystem_error(self) -> Error {
        match self {
            Self::Task(remote) => Error::Filesystem(remote.message),
            other => Error::Filesystem(other.to_string()),
        }
    }
}

/// An error crossing the worker boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Closed,
    Stream,
    Filesystem,
    Other,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        match err {
            Error::Closed => Self::new(RemoteErrorKind::Closed, err.to_string()),
            Error::Stream(message) => Self::new(RemoteErrorKind::Stream, message),
            Error::Filesystem(message) => Self::new(RemoteErrorKind::Filesystem, message),
            other => Self::new(RemoteErrorKind::Other, other.to_string()),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Closed => Error::Closed,
            RemoteErrorKind::Filesystem => Error::Filesystem(err.message),
            RemoteErrorKind::Stream | RemoteErrorKind::Other => Error::Stream(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_kind() {
        let remote = RemoteError::from(Error::Stream("disk full".into()));
        assert_eq!(remote.kind, RemoteErrorKind::Stream);
        assert_eq!(remote.message, "disk full");
        assert!(matches!(Error::from(remote), Error::Stream(m) if m == "disk full"));

        let closed = RemoteError::from(Error::Closed);
        assert!(Error::from(closed).is_closed());
    }

    #[test]
    fn worker_errors_map_per_call_site() {
        assert!(matches!(
            WorkerError::Exited.into_stream_error(),
            Error::Stream(_)
        ));
        assert!(matches!(
            WorkerError::Exited.into_filesystem_error(),
            Error::Filesystem(_)
        ));
        assert!(matches!(
            WorkerError::Cancelled.into_stream_error(),
            Error::Cancelled
        ));
        let remote = RemoteError::new(RemoteErrorKind::Filesystem, "open /x: not found");
        assert!(matches!(
            WorkerError::Task(remote).into_filesystem_error(),
            Error::Filesystem(m) if m == "open /x: not found"
        ));
    }

    #[test]
    fn worker_ids_are_unique() {
        assert_ne!(next_worker_id(), next_worker_id());
    }
}
