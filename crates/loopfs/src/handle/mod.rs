//! File handles.
//!
//! A [`FileHandle`] is the per-open-session object every strategy returns.
//! It owns one [`FileBackend`] and applies the same admission rules whatever
//! the backend is:
//!
//! | Call | Refused with `PendingOperation` when | Refused with `Closed` when |
//! |------|--------------------------------------|----------------------------|
//! | `read` | a read is active, or writes are queued | closing or closed |
//! | `write` / `truncate` | a read is active | not writable (mode, `end`, closing) |
//! | `seek` | a read is active | closing or closed |
//!
//! Admission happens synchronously when the method is called, and the
//! operation starts right away on the Tokio runtime. The returned
//! [`Completion`] only reports the outcome, so writes issued back to back
//! without awaiting still reach the file in call order.
//!
//! # Position bookkeeping
//!
//! Each write captures its offset at admission (the current position, or
//! the best-known end of file in append modes) and advances the position
//! immediately, so the next queued write lands right after it. A failed
//! write rolls the position back only if nothing moved it in the meantime.
//! Truncating below the position leaves the position unchanged, like a
//! regular file offset.

mod completion;
mod queue;

pub use completion::Completion;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::FileBackend;
use crate::error::{Error, Result};
use crate::logging_impl::{display_path, log_debug};
use crate::mode::{OpenMode, Whence};
use queue::{OperationQueue, Ticket};

/// Callback run after every successful mutation of the file.
pub(crate) type MutationHook = Arc<dyn Fn() + Send + Sync>;

/// Observable state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// Open with nothing in flight.
    Idle,
    /// A read is in flight.
    ReadActive,
    /// One or more writes/truncates are queued or in flight.
    WritesPending,
    /// Close started; queued writes are draining.
    Closing,
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

struct HandleState {
    position: i64,
    size: u64,
    writable: bool,
    reading: bool,
    queue: OperationQueue,
    lifecycle: Lifecycle,
    close_listeners: Vec<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    path: PathBuf,
    mode: OpenMode,
    backend: Box<dyn FileBackend>,
    state: Mutex<HandleState>,
    closed: watch::Sender<bool>,
    mutation_hook: OnceLock<MutationHook>,
}

/// An open file.
///
/// Dropping a handle that is still open closes it in the background.
pub struct FileHandle {
    inner: Arc<Inner>,
}

impl FileHandle {
    /// Wrap an opened backend. `size` is the file size at open time.
    ///
    /// Custom [`FilesystemDriver`](crate::FilesystemDriver) implementations
    /// use this to hand out handles over their own backends.
    pub fn new(
        path: PathBuf,
        mode: OpenMode,
        size: u64,
        backend: impl FileBackend + 'static,
    ) -> Self {
        let position = if mode.is_append() { to_position(size) } else { 0 };
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                path,
                mode,
                backend: Box::new(backend),
                state: Mutex::new(HandleState {
                    position,
                    size,
                    writable: mode.is_writable(),
                    reading: false,
                    queue: OperationQueue::new(),
                    lifecycle: Lifecycle::Open,
                    close_listeners: Vec::new(),
                }),
                closed,
                mutation_hook: OnceLock::new(),
            }),
        }
    }

    /// Run `hook` after every successful write, truncate and close.
    pub(crate) fn set_mutation_hook(&self, hook: MutationHook) {
        let _ = self.inner.mutation_hook.set(hook);
    }

    /// Read up to `length` bytes from the current position.
    ///
    /// Resolves to `None` at end of file. Fewer than `length` bytes are
    /// returned only when the end of file was reached.
    ///
    /// If `cancel` fires first, the read fails with [`Error::Cancelled`] and
    /// the handle accepts new reads again; backend work already started may
    /// still run to completion, its result is discarded.
    pub fn read(
        &self,
        length: usize,
        cancel: Option<CancellationToken>,
    ) -> Completion<Option<Bytes>> {
        let offset = {
            let mut state = self.inner.state();
            if state.lifecycle != Lifecycle::Open {
                return Completion::ready(Err(Error::Closed));
            }
            if !self.inner.mode.is_readable() {
                return Completion::ready(Err(Error::Stream(format!(
                    "file opened in mode '{}' is not readable",
                    self.inner.mode
                ))));
            }
            if state.reading {
                return Completion::ready(Err(Error::PendingOperation(
                    "a read is already active",
                )));
            }
            if !state.queue.is_empty() {
                return Completion::ready(Err(Error::PendingOperation(
                    "cannot read while writes are pending",
                )));
            }
            if length == 0 {
                return Completion::ready(Ok(Some(Bytes::new())));
            }
            let offset = match to_offset(state.position) {
                Ok(offset) => offset,
                Err(err) => return Completion::ready(Err(err)),
            };
            state.reading = true;
            offset
        };

        let (tx, completion) = Completion::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.run_read(offset, length, cancel).await;
            let _ = tx.send(result);
        });
        completion
    }

    /// Write `data` at the current position (or at the end in append modes).
    ///
    /// Writes are admitted even while earlier writes are still queued; they
    /// reach the file in call order.
    pub fn write(&self, data: impl Into<Bytes>) -> Completion<()> {
        let data = data.into();
        let (mut ticket, offset, end, previous_size) = {
            let mut state = self.inner.state();
            if let Err(err) = state.admit_mutation() {
                return Completion::ready(Err(err));
            }
            let start = if self.inner.mode.is_append() {
                to_position(state.size)
            } else {
                state.position
            };
            let offset = match to_offset(start) {
                Ok(offset) => offset,
                Err(err) => return Completion::ready(Err(err)),
            };
            let end = offset + data.len() as u64;
            let previous_size = state.size;
            state.position = to_position(end);
            state.size = state.size.max(end);
            (state.queue.admit(), offset, end, previous_size)
        };

        let (tx, completion) = Completion::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ticket.wait_turn().await;
            let result = if data.is_empty() {
                Ok(())
            } else {
                inner.backend.write(offset, data).await
            };
            inner.settle(ticket, result.is_ok(), |state| {
                if result.is_err() {
                    if state.position == to_position(end) {
                        state.position = to_position(offset);
                    }
                    if state.size == end && end > previous_size {
                        state.size = previous_size;
                    }
                }
            });
            let _ = tx.send(result);
        });
        completion
    }

    /// Resize the file to `size` bytes; growing fills with zero bytes.
    ///
    /// The position is left where it is, even past the new end.
    pub fn truncate(&self, size: u64) -> Completion<()> {
        let (mut ticket, previous_size) = {
            let mut state = self.inner.state();
            if let Err(err) = state.admit_mutation() {
                return Completion::ready(Err(err));
            }
            let previous_size = state.size;
            state.size = size;
            (state.queue.admit(), previous_size)
        };

        let (tx, completion) = Completion::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            ticket.wait_turn().await;
            let result = inner.backend.truncate(size).await;
            inner.settle(ticket, result.is_ok(), |state| {
                if result.is_err() && state.size == size {
                    state.size = previous_size;
                }
            });
            let _ = tx.send(result);
        });
        completion
    }

    /// Move the position. Returns the new position.
    ///
    /// Negative results are accepted here and fail on the next read or write.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<i64> {
        let mut state = self.inner.state();
        if state.lifecycle != Lifecycle::Open {
            return Err(Error::Closed);
        }
        if state.reading {
            return Err(Error::PendingOperation("cannot seek while a read is active"));
        }
        let position = match whence {
            Whence::Start => offset,
            Whence::Current => state.position.saturating_add(offset),
            Whence::End => to_position(state.size).saturating_add(offset),
        };
        state.position = position;
        Ok(position)
    }

    /// Current position.
    pub fn tell(&self) -> i64 {
        self.inner.state().position
    }

    /// Best-known size of the file.
    pub fn size(&self) -> u64 {
        self.inner.state().size
    }

    /// True when nothing is in flight and the position is at or past the end.
    pub fn eof(&self) -> bool {
        let state = self.inner.state();
        state.queue.is_empty() && !state.reading && state.position >= to_position(state.size)
    }

    /// Close the handle.
    ///
    /// Idempotent and infallible. Writes queued before the call still run and
    /// report their own outcomes; nothing new is admitted once closing began.
    /// Errors while releasing the backend are swallowed.
    pub async fn close(&self) {
        if let Some(close) = self.inner.begin_close() {
            tokio::spawn(close);
        }
        self.inner.wait_closed().await;
    }

    /// Stop accepting writes, then close.
    pub async fn end(&self) {
        self.inner.state().writable = false;
        self.close().await;
    }

    /// True once closing began.
    pub fn is_closed(&self) -> bool {
        self.inner.state().lifecycle != Lifecycle::Open
    }

    /// Run `callback` once the handle is fully closed.
    ///
    /// Runs immediately if the handle is already closed.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state();
        if state.lifecycle == Lifecycle::Closed {
            drop(state);
            callback();
        } else {
            state.close_listeners.push(Box::new(callback));
        }
    }

    pub fn status(&self) -> HandleStatus {
        let state = self.inner.state();
        match state.lifecycle {
            Lifecycle::Closed => HandleStatus::Closed,
            Lifecycle::Closing => HandleStatus::Closing,
            Lifecycle::Open if state.reading => HandleStatus::ReadActive,
            Lifecycle::Open if !state.queue.is_empty() => HandleStatus::WritesPending,
            Lifecycle::Open => HandleStatus::Idle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn mode(&self) -> OpenMode {
        self.inner.mode
    }

    pub fn is_readable(&self) -> bool {
        self.inner.mode.is_readable() && !self.is_closed()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.state().writable
    }

    pub fn is_seekable(&self) -> bool {
        !self.is_closed()
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.inner.path)
            .field("mode", &self.inner.mode)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Without a runtime the backend is released when the last task
        // holding it goes away.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            if let Some(close) = self.inner.begin_close() {
                runtime.spawn(close);
            }
        }
    }
}

impl HandleState {
    fn admit_mutation(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::Closed);
        }
        if self.reading {
            return Err(Error::PendingOperation(
                "cannot write while a read is active",
            ));
        }
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_read(
        &self,
        offset: u64,
        length: usize,
        cancel: Option<CancellationToken>,
    ) -> Result<Option<Bytes>> {
        let _active = ActiveRead(self);
        let read = self.backend.read(offset, length, cancel.clone());
        let result = match &cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    result = read => result,
                }
            }
            None => read.await,
        };

        let data = result?;
        let mut state = self.state();
        if data.is_empty() {
            return Ok(None);
        }
        let end = offset + data.len() as u64;
        if state.position == to_position(offset) {
            state.position = to_position(end);
        }
        state.size = state.size.max(end);
        Ok(Some(data))
    }

    /// Apply the outcome of a queued operation, trim it from the queue and
    /// hand the turn to the next one.
    fn settle(&self, ticket: Ticket, succeeded: bool, update: impl FnOnce(&mut HandleState)) {
        {
            let mut state = self.state();
            update(&mut state);
            state.queue.settle(ticket.id());
        }
        ticket.finish();
        if succeeded {
            self.notify_mutation();
        }
    }

    fn notify_mutation(&self) {
        if let Some(hook) = self.mutation_hook.get() {
            hook();
        }
    }

    /// Start closing. Returns the work to spawn, or `None` when another call
    /// already started it.
    fn begin_close(self: &Arc<Self>) -> Option<impl Future<Output = ()> + Send + 'static> {
        let drained = {
            let mut state = self.state();
            if state.lifecycle != Lifecycle::Open {
                return None;
            }
            state.lifecycle = Lifecycle::Closing;
            state.writable = false;
            state.queue.drain_signal()
        };

        let inner = Arc::clone(self);
        Some(async move {
            if let Some(drained) = drained {
                let _ = drained.await;
            }
            if let Err(err) = inner.backend.close().await {
                log_debug!(
                    path = %display_path(&inner.path),
                    error = %err,
                    "ignoring error while closing"
                );
            }
            inner.finish_close();
        })
    }

    fn finish_close(&self) {
        let listeners = {
            let mut state = self.state();
            state.lifecycle = Lifecycle::Closed;
            std::mem::take(&mut state.close_listeners)
        };
        self.closed.send_replace(true);
        log_debug!(path = %display_path(&self.path), "file closed");
        self.notify_mutation();
        for listener in listeners {
            listener();
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Clears the active-read flag when the read ends, panics included.
struct ActiveRead<'a>(&'a Inner);

impl Drop for ActiveRead<'_> {
    fn drop(&mut self) {
        self.0.state().reading = false;
    }
}

fn to_position(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_offset(position: i64) -> Result<u64> {
    u64::try_from(position).map_err(|_| Error::Stream(format!("invalid position {position}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing {
    //! In-memory backend for exercising the handle discipline.

    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    pub(crate) struct MemoryBackend {
        pub(crate) data: Arc<Mutex<Vec<u8>>>,
        pub(crate) closed: Arc<AtomicBool>,
        pub(crate) close_calls: Arc<AtomicUsize>,
        /// Reads never complete.
        pub(crate) stall_reads: Arc<AtomicBool>,
        /// Writes at these offsets fail.
        pub(crate) failing_offsets: Arc<Mutex<HashSet<u64>>>,
        /// Writes at these offsets yield a few times first.
        pub(crate) slow: Arc<AtomicBool>,
        /// Reads panic.
        pub(crate) panic_reads: Arc<AtomicBool>,
    }

    impl MemoryBackend {
        pub(crate) fn with_contents(contents: &[u8]) -> Self {
            let backend = Self::default();
            *backend.data.lock().unwrap() = contents.to_vec();
            backend
        }

        pub(crate) fn contents(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }

        pub(crate) fn handle(&self, mode: OpenMode) -> FileHandle {
            let size = self.data.lock().unwrap().len() as u64;
            FileHandle::new(PathBuf::from("/mem/file"), mode, size, self.clone())
        }
    }

    #[async_trait]
    impl FileBackend for MemoryBackend {
        async fn read(
            &self,
            offset: u64,
            length: usize,
            _cancel: Option<CancellationToken>,
        ) -> Result<Bytes> {
            if self.stall_reads.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            assert!(!self.panic_reads.load(Ordering::SeqCst), "read blew up");
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            let data = self.data.lock().unwrap();
            let start = (offset as usize).min(data.len());
            let end = start.saturating_add(length).min(data.len());
            Ok(Bytes::copy_from_slice(&data[start..end]))
        }

        async fn write(&self, offset: u64, bytes: Bytes) -> Result<()> {
            if self.slow.load(Ordering::SeqCst) {
                for _ in 0..(8 - (offset % 8)) {
                    tokio::task::yield_now().await;
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if self.failing_offsets.lock().unwrap().contains(&offset) {
                return Err(Error::Stream("injected write failure".into()));
            }
            let mut data = self.data.lock().unwrap();
            let offset = offset as usize;
            if data.len() < offset + bytes.len() {
                data.resize(offset + bytes.len(), 0);
            }
            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            Ok(())
        }

        async fn truncate(&self, size: u64) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            self.data.lock().unwrap().resize(size as usize, 0);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
