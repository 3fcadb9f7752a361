//! Delegated strategy: files live on pool workers.
//!
//! Opening a file asks the [`WorkerScheduler`] for a worker and pins the file
//! to it. Every later operation on the handle runs on that worker; closing
//! releases the worker lease. Whole-path requests go to any pool worker.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{FileBackend, FilesystemDriver};
use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::logging_impl::{display_path, log_debug};
use crate::metadata::{FsRequest, FsResponse};
use crate::mode::OpenMode;
use crate::worker::{
    FileTask, LocalWorkerPool, TaskOutcome, Worker, WorkerError, WorkerLease, WorkerPool,
    WorkerScheduler,
};

/// Driver running file operations on a worker pool.
pub struct DelegatedDriver {
    pool: Arc<dyn WorkerPool>,
    scheduler: WorkerScheduler,
}

impl DelegatedDriver {
    /// `worker_limit` bounds the number of distinct workers hosting open
    /// files at any time.
    pub fn new(pool: Arc<dyn WorkerPool>, worker_limit: usize) -> Self {
        Self {
            scheduler: WorkerScheduler::new(Arc::clone(&pool), worker_limit),
            pool,
        }
    }

    /// Driver over a pool of worker threads.
    pub fn threads(worker_limit: usize, pool_limit: usize) -> Self {
        Self::new(Arc::new(LocalWorkerPool::threads(pool_limit)), worker_limit)
    }

    pub fn scheduler(&self) -> &WorkerScheduler {
        &self.scheduler
    }
}

impl fmt::Debug for DelegatedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedDriver")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FilesystemDriver for DelegatedDriver {
    async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle> {
        let lease = self
            .scheduler
            .select_worker()
            .await
            .map_err(WorkerError::into_filesystem_error)?;
        let task = FileTask::Open {
            path: path.to_path_buf(),
            mode,
        };
        let outcome = lease
            .worker()
            .execute(task, None)
            .await
            .map_err(WorkerError::into_filesystem_error)?;
        let TaskOutcome::Opened { file, size } = outcome else {
            return Err(Error::Filesystem(format!(
                "unexpected worker response to open: {outcome:?}"
            )));
        };
        log_debug!(
            path = %display_path(path),
            %mode,
            worker = lease.worker().id(),
            "opened file on worker"
        );
        let backend = DelegatedFile {
            file,
            lease: Mutex::new(Some(lease)),
        };
        Ok(FileHandle::new(path.to_path_buf(), mode, size, backend))
    }

    async fn execute(&self, request: FsRequest) -> Result<FsResponse> {
        let worker = self
            .pool
            .get_worker()
            .await
            .map_err(WorkerError::into_filesystem_error)?;
        match worker
            .execute(FileTask::Path { request }, None)
            .await
            .map_err(WorkerError::into_filesystem_error)?
        {
            TaskOutcome::Path(response) => Ok(response),
            other => Err(Error::Filesystem(format!(
                "unexpected worker response to path request: {other:?}"
            ))),
        }
    }
}

struct DelegatedFile {
    file: u64,
    /// `None` once closed.
    lease: Mutex<Option<WorkerLease>>,
}

impl DelegatedFile {
    fn worker(&self) -> Result<Arc<dyn Worker>> {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|lease| Arc::clone(lease.worker()))
            .ok_or(Error::Closed)
    }

    async fn run(&self, task: FileTask, cancel: Option<CancellationToken>) -> Result<TaskOutcome> {
        self.worker()?
            .execute(task, cancel)
            .await
            .map_err(WorkerError::into_stream_error)
    }

    async fn expect_done(&self, task: FileTask) -> Result<()> {
        match self.run(task, None).await? {
            TaskOutcome::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl FileBackend for DelegatedFile {
    async fn read(
        &self,
        offset: u64,
        length: usize,
        cancel: Option<CancellationToken>,
    ) -> Result<Bytes> {
        let task = FileTask::Read {
            file: self.file,
            offset,
            length,
        };
        match self.run(task, cancel).await? {
            TaskOutcome::Data(data) => Ok(Bytes::from(data)),
            other => Err(unexpected(&other)),
        }
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.expect_done(FileTask::Write {
            file: self.file,
            offset,
            data: data.to_vec(),
        })
        .await
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.expect_done(FileTask::Truncate {
            file: self.file,
            size,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::Closed)?;
        let closed = lease
            .worker()
            .execute(FileTask::Close { file: self.file }, None)
            .await;
        drop(lease);
        closed.map(drop).map_err(WorkerError::into_stream_error)
    }
}

impl Drop for DelegatedFile {
    fn drop(&mut self) {
        let Some(lease) = self
            .lease
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        // Without a runtime the lease is released right here and the worker
        // keeps the file until it dies.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let file = self.file;
            runtime.spawn(async move {
                let _ = lease.worker().execute(FileTask::Close { file }, None).await;
            });
        }
    }
}

fn unexpected(outcome: &TaskOutcome) -> Error {
    Error::Stream(format!("unexpected worker response: {outcome:?}"))
}
