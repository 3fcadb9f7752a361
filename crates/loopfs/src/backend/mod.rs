//! Backend strategies.
//!
//! Two traits split the work:
//!
//! - [`FilesystemDriver`] opens files and runs single-shot whole-path
//!   requests. One driver serves many handles.
//! - [`FileBackend`] performs positional I/O for one open file. The
//!   [`FileHandle`] owns it and applies the admission and ordering rules, so
//!   backends never see overlapping writes or reads racing writes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   FileHandle                     │
//! │   (operation queue, position/size bookkeeping)   │
//! └─────────────────────────┬────────────────────────┘
//!                           │ FileBackend
//!        ┌──────────────────┼──────────────────┐
//!        │                  │                  │
//! ┌──────▼──────┐    ┌──────▼──────┐    ┌──────▼──────┐
//! │ InlineFile  │    │ NativeFile  │    │DelegatedFile│
//! │ (blocking)  │    │ (callback + │    │ (task on a  │
//! │             │    │  PollGuard) │    │   worker)   │
//! └─────────────┘    └─────────────┘    └─────────────┘
//! ```

mod delegated;
mod inline;
mod native;

pub use delegated::DelegatedDriver;
pub use inline::InlineDriver;
pub use native::{
    BlockingProvider, NativeCallback, NativeDriver, NativeProvider, NativeRequest, NativeResponse,
};

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::handle::FileHandle;
use crate::metadata::{FsRequest, FsResponse};
use crate::mode::OpenMode;

/// Positional I/O on one open file.
///
/// # Contract
///
/// - `read` returns fewer than `length` bytes only at end of file, and an
///   empty buffer when nothing is left.
/// - `write` writes every byte or fails.
/// - `close` releases the resource; later calls fail with `Error::Closed`.
/// - Failures use `Error::Closed` for a closed resource and `Error::Stream`
///   for everything else.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Read up to `length` bytes at `offset`.
    ///
    /// `cancel` lets a backend abandon remote work early; the handle races
    /// the token itself, so backends may ignore it.
    async fn read(&self, offset: u64, length: usize, cancel: Option<CancellationToken>)
    -> Result<Bytes>;

    /// Write `data` at `offset`.
    async fn write(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Resize the file to `size` bytes.
    async fn truncate(&self, size: u64) -> Result<()>;

    /// Release the resource.
    async fn close(&self) -> Result<()>;
}

/// A filesystem execution strategy.
///
/// All implementations must be `Send + Sync`; one driver is shared by every
/// handle it opens.
#[async_trait]
pub trait FilesystemDriver: Send + Sync {
    /// Open `path` in `mode`.
    ///
    /// # Errors
    /// - `Filesystem` if the file cannot be opened
    async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle>;

    /// Run a single-shot whole-path request.
    ///
    /// # Errors
    /// - `Filesystem` for any failure
    async fn execute(&self, request: FsRequest) -> Result<FsResponse>;
}
