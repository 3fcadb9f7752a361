//! Inline strategy: blocking calls made directly on the calling task.
//!
//! Always available and never defers work to another thread. Useful when no
//! multi-threaded runtime is around and as the execution engine inside
//! workers.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{FileBackend, FilesystemDriver};
use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::logging_impl::{display_path, log_debug};
use crate::metadata::{FsRequest, FsResponse};
use crate::mode::OpenMode;
use crate::sys;

/// Driver performing every call synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDriver;

impl InlineDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FilesystemDriver for InlineDriver {
    async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle> {
        let (file, size) = sys::open(path, mode)?;
        log_debug!(path = %display_path(path), %mode, size, "opened file inline");
        Ok(FileHandle::new(
            path.to_path_buf(),
            mode,
            size,
            InlineFile {
                file: Mutex::new(Some(file)),
            },
        ))
    }

    async fn execute(&self, request: FsRequest) -> Result<FsResponse> {
        sys::execute(request)
    }
}

struct InlineFile {
    file: Mutex<Option<File>>,
}

impl InlineFile {
    fn with_file<T>(&self, op: impl FnOnce(&File) -> io::Result<T>) -> Result<T> {
        let guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let file = guard.as_ref().ok_or(Error::Closed)?;
        op(file).map_err(Error::stream)
    }
}

#[async_trait]
impl FileBackend for InlineFile {
    async fn read(
        &self,
        offset: u64,
        length: usize,
        _cancel: Option<CancellationToken>,
    ) -> Result<Bytes> {
        self.with_file(|file| sys::read_at(file, offset, length))
            .map(Bytes::from)
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.with_file(|file| sys::write_all_at(file, offset, &data))
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.with_file(|file| sys::truncate(file, size))
    }

    async fn close(&self) -> Result<()> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(drop)
            .ok_or(Error::Closed)
    }
}
