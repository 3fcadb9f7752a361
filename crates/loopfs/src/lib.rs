//! Loopfs - Non-blocking file access for cooperative async runtimes
//!
//! One [`FileHandle`] abstraction over three execution strategies:
//!
//! - [`InlineDriver`]: blocking calls on the calling task.
//! - [`NativeDriver`]: a callback-based async I/O provider, with a
//!   [`PollGuard`] keeping the host loop alive only while requests are
//!   outstanding.
//! - [`DelegatedDriver`]: files hosted on pool workers (threads or
//!   `loopfs-worker` subprocesses), at most `worker_limit` of them at once.
//!
//! Whatever the strategy, a handle admits writes without waiting for earlier
//! ones and applies them in call order, allows one read at a time, and never
//! lets a read overlap queued writes.
//!
//! # Example
//!
//! ```rust
//! use loopfs::{Filesystem, FsConfig, OpenMode, Whence};
//!
//! #[tokio::main]
//! async fn main() -> loopfs::Result<()> {
//!     let dir = tempfile::tempdir().expect("temp dir");
//!     let fs = Filesystem::from_config(&FsConfig::default())?;
//!
//!     let file = fs.open_file(dir.path().join("log.txt"), OpenMode::WriteRead).await?;
//!     // Issued back to back; applied in order.
//!     let first = file.write("hello ");
//!     let second = file.write("world");
//!     first.await?;
//!     second.await?;
//!
//!     file.seek(0, Whence::Start)?;
//!     let data = file.read(64, None).await?;
//!     assert_eq!(data.as_deref(), Some(&b"hello world"[..]));
//!     file.close().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
mod cache;
mod config;
mod error;
mod filesystem;
mod handle;
mod logging_impl;
mod metadata;
mod mode;
mod poll;
mod sys;
pub mod worker;

pub use backend::{
    BlockingProvider, DelegatedDriver, FileBackend, FilesystemDriver, InlineDriver, NativeDriver,
    NativeProvider,
};
pub use cache::StatusCache;
pub use config::{
    DEFAULT_POOL_LIMIT, DEFAULT_STATUS_CACHE_TTL_MS, DEFAULT_WORKER_LIMIT, DriverKind, FsConfig,
};
pub use error::{Error, Result};
pub use filesystem::Filesystem;
pub use handle::{Completion, FileHandle, HandleStatus};
pub use logging_impl::{display_path, sanitize_for_log};
pub use metadata::{FileType, FsRequest, FsResponse, Metadata};
pub use mode::{OpenMode, Whence};
pub use poll::{IdleWatcher, PollGuard, Watcher, WatcherState};

/// Re-exported for implementing [`FilesystemDriver`], [`FileBackend`] and
/// worker traits.
pub use async_trait::async_trait;
/// Re-exported cancellation token accepted by [`FileHandle::read`].
pub use tokio_util::sync::CancellationToken;
