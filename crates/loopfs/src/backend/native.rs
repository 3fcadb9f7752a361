//! Native strategy: requests handed to a callback-based async I/O provider.
//!
//! The provider reports completion through a callback. Every submission is
//! bracketed by the driver's [`PollGuard`]: `listen` right before submitting
//! and `done` when the callback runs (or is dropped unrun), so the watcher
//! stays enabled exactly while requests are outstanding even if the awaiting
//! caller went away.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{FileBackend, FilesystemDriver};
use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::logging_impl::{display_path, log_debug};
use crate::metadata::{FsRequest, FsResponse};
use crate::mode::OpenMode;
use crate::poll::{IdleWatcher, PollGuard, Watcher};
use crate::sys;

/// Completion callback. Invoked exactly once per submitted request.
pub type NativeCallback = Box<dyn FnOnce(Result<NativeResponse>) + Send>;

/// A request for a native provider. Open files are named by the descriptor
/// the provider returned from `Open`.
#[derive(Debug)]
pub enum NativeRequest {
    Open { path: PathBuf, mode: OpenMode },
    Read { descriptor: u64, offset: u64, length: usize },
    Write { descriptor: u64, offset: u64, data: Bytes },
    Truncate { descriptor: u64, size: u64 },
    Close { descriptor: u64 },
    Path(FsRequest),
}

#[derive(Debug)]
pub enum NativeResponse {
    Opened { descriptor: u64, size: u64 },
    Data(Bytes),
    Done,
    Path(FsResponse),
}

/// A callback-based asynchronous I/O facility.
///
/// Errors follow the crate taxonomy: `Closed` for an unknown or closed
/// descriptor, `Stream` for I/O on an open file, `Filesystem` for opens and
/// whole-path requests.
pub trait NativeProvider: Send + Sync {
    fn submit(&self, request: NativeRequest, callback: NativeCallback);
}

/// Provider running requests on the Tokio blocking pool.
pub struct BlockingProvider {
    runtime: tokio::runtime::Handle,
    files: Arc<Mutex<HashMap<u64, Arc<File>>>>,
    next_descriptor: AtomicU64,
}

impl BlockingProvider {
    /// Provider bound to the runtime of the calling context.
    ///
    /// # Errors
    /// - `Config` when called outside a Tokio runtime
    pub fn current() -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| Error::Config(format!("native provider needs a Tokio runtime: {err}")))?;
        Ok(Self::with_runtime(runtime))
    }

    pub fn with_runtime(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            files: Arc::new(Mutex::new(HashMap::new())),
            next_descriptor: AtomicU64::new(1),
        }
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        lock(&self.files).len()
    }
}

impl fmt::Debug for BlockingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingProvider")
            .field("open_descriptors", &self.open_descriptors())
            .finish()
    }
}

impl NativeProvider for BlockingProvider {
    fn submit(&self, request: NativeRequest, callback: NativeCallback) {
        let files = Arc::clone(&self.files);
        // Allocated up front so descriptors stay unique without holding the
        // table lock on the blocking thread.
        let descriptor = match request {
            NativeRequest::Open { .. } => self.next_descriptor.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.runtime.spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_blocking(&files, descriptor, request)
            }))
            .unwrap_or_else(|_| Err(Error::Stream("native request panicked".into())));
            callback(result);
        });
    }
}

fn run_blocking(
    files: &Mutex<HashMap<u64, Arc<File>>>,
    new_descriptor: u64,
    request: NativeRequest,
) -> Result<NativeResponse> {
    let lookup = |descriptor: u64| lock(files).get(&descriptor).cloned().ok_or(Error::Closed);
    match request {
        NativeRequest::Open { path, mode } => {
            let (file, size) = sys::open(&path, mode)?;
            lock(files).insert(new_descriptor, Arc::new(file));
            Ok(NativeResponse::Opened {
                descriptor: new_descriptor,
                size,
            })
        }
        NativeRequest::Read {
            descriptor,
            offset,
            length,
        } => {
            let file = lookup(descriptor)?;
            let data = sys::read_at(&file, offset, length).map_err(Error::stream)?;
            Ok(NativeResponse::Data(Bytes::from(data)))
        }
        NativeRequest::Write {
            descriptor,
            offset,
            data,
        } => {
            let file = lookup(descriptor)?;
            sys::write_all_at(&file, offset, &data).map_err(Error::stream)?;
            Ok(NativeResponse::Done)
        }
        NativeRequest::Truncate { descriptor, size } => {
            let file = lookup(descriptor)?;
            sys::truncate(&file, size).map_err(Error::stream)?;
            Ok(NativeResponse::Done)
        }
        NativeRequest::Close { descriptor } => {
            lock(files).remove(&descriptor).ok_or(Error::Closed)?;
            Ok(NativeResponse::Done)
        }
        NativeRequest::Path(request) => sys::execute(request).map(NativeResponse::Path),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider plus the guard bracketing its requests.
#[derive(Clone)]
struct Submitter {
    provider: Arc<dyn NativeProvider>,
    guard: Arc<PollGuard>,
}

impl Submitter {
    async fn submit(&self, request: NativeRequest) -> Result<NativeResponse> {
        let (tx, rx) = oneshot::channel();
        self.detach(request, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| Err(Error::Stream("native request dropped by provider".into())))
    }

    /// Submit without waiting for the outcome.
    fn detach(
        &self,
        request: NativeRequest,
        on_complete: impl FnOnce(Result<NativeResponse>) + Send + 'static,
    ) {
        self.guard.listen();
        let settle = Settle(Arc::clone(&self.guard));
        self.provider.submit(
            request,
            Box::new(move |result| {
                drop(settle);
                on_complete(result);
            }),
        );
    }
}

/// Calls [`PollGuard::done`] once, when the callback runs or is dropped
/// without running.
struct Settle(Arc<PollGuard>);

impl Drop for Settle {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Driver over a [`NativeProvider`].
pub struct NativeDriver {
    submitter: Submitter,
}

impl NativeDriver {
    pub fn new(provider: impl NativeProvider + 'static, watcher: impl Watcher + 'static) -> Self {
        Self {
            submitter: Submitter {
                provider: Arc::new(provider),
                guard: Arc::new(PollGuard::new(watcher)),
            },
        }
    }

    /// Driver over a [`BlockingProvider`] on the current runtime.
    ///
    /// Returns the [`IdleWatcher`] so the host can await quiescence.
    ///
    /// # Errors
    /// - `Config` when called outside a Tokio runtime
    pub fn current() -> Result<(Self, IdleWatcher)> {
        let watcher = IdleWatcher::new();
        let driver = Self::new(BlockingProvider::current()?, watcher.clone());
        Ok((driver, watcher))
    }

    /// Requests submitted and not yet completed.
    pub fn outstanding_requests(&self) -> usize {
        self.submitter.guard.outstanding_requests()
    }
}

impl fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDriver")
            .field("outstanding_requests", &self.outstanding_requests())
            .finish()
    }
}

#[async_trait]
impl FilesystemDriver for NativeDriver {
    async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle> {
        let request = NativeRequest::Open {
            path: path.to_path_buf(),
            mode,
        };
        match self.submitter.submit(request).await? {
            NativeResponse::Opened { descriptor, size } => {
                log_debug!(path = %display_path(path), %mode, descriptor, "opened file natively");
                let file = NativeFile {
                    submitter: self.submitter.clone(),
                    descriptor,
                    closed: AtomicBool::new(false),
                };
                Ok(FileHandle::new(path.to_path_buf(), mode, size, file))
            }
            other => Err(Error::Filesystem(unexpected(&other))),
        }
    }

    async fn execute(&self, request: FsRequest) -> Result<FsResponse> {
        match self.submitter.submit(NativeRequest::Path(request)).await? {
            NativeResponse::Path(response) => Ok(response),
            other => Err(Error::Filesystem(unexpected(&other))),
        }
    }
}

struct NativeFile {
    submitter: Submitter,
    descriptor: u64,
    closed: AtomicBool,
}

impl NativeFile {
    async fn expect_done(&self, request: NativeRequest) -> Result<()> {
        match self.submitter.submit(request).await? {
            NativeResponse::Done => Ok(()),
            other => Err(Error::Stream(unexpected(&other))),
        }
    }
}

#[async_trait]
impl FileBackend for NativeFile {
    async fn read(
        &self,
        offset: u64,
        length: usize,
        _cancel: Option<CancellationToken>,
    ) -> Result<Bytes> {
        let request = NativeRequest::Read {
            descriptor: self.descriptor,
            offset,
            length,
        };
        match self.submitter.submit(request).await? {
            NativeResponse::Data(data) => Ok(data),
            other => Err(Error::Stream(unexpected(&other))),
        }
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.expect_done(NativeRequest::Write {
            descriptor: self.descriptor,
            offset,
            data,
        })
        .await
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.expect_done(NativeRequest::Truncate {
            descriptor: self.descriptor,
            size,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.expect_done(NativeRequest::Close {
            descriptor: self.descriptor,
        })
        .await
    }
}

impl Drop for NativeFile {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.submitter.detach(
                NativeRequest::Close {
                    descriptor: self.descriptor,
                },
                drop,
            );
        }
    }
}

fn unexpected(response: &NativeResponse) -> String {
    format!("unexpected native response: {response:?}")
}
