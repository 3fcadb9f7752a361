//! Status cache decorator.
//!
//! Wraps any [`FilesystemDriver`] and remembers successful `status` and
//! `link_status` results for a fixed TTL. Missing paths are never cached.
//!
//! Entries are dropped when a request through the cache may have changed
//! them:
//!
//! | Request | Invalidates |
//! |---------|-------------|
//! | touch, delete_file, create_directory, delete_directory, change_permissions, write | path and everything below it |
//! | move | both paths and everything below them |
//! | create_symlink | the link |
//! | write/truncate/close on a handle opened through the cache | the handle's path |
//!
//! Changes made behind the cache's back are only picked up once entries
//! expire.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::backend::FilesystemDriver;
use crate::error::Result;
use crate::handle::FileHandle;
use crate::logging_impl::{display_path, log_trace};
use crate::metadata::{FsRequest, FsResponse, Metadata};
use crate::mode::OpenMode;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    follow_symlinks: bool,
}

struct Entry {
    metadata: Metadata,
    expires: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    /// Bumped on every invalidation so lookups racing a mutation do not
    /// store what they saw before it.
    generation: u64,
}

#[derive(Clone, Default)]
struct SharedState(Arc<Mutex<CacheState>>);

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self, path: &Path) {
        let mut state = self.lock();
        state.generation += 1;
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.path.starts_with(path));
        if state.entries.len() != before {
            log_trace!(
                path = %display_path(path),
                dropped = before - state.entries.len(),
                "status cache invalidated"
            );
        }
    }
}

/// A [`FilesystemDriver`] caching status results of another driver.
pub struct StatusCache<D> {
    inner: D,
    ttl: Duration,
    state: SharedState,
}

impl<D: FilesystemDriver> StatusCache<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            state: SharedState::default(),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.entries.clear();
    }

    /// Number of entries that have not expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &CacheKey) -> Option<Metadata> {
        let mut state = self.state.lock();
        let entry = state.entries.get(key)?;
        if entry.expires > Instant::now() {
            log_trace!(path = %display_path(&key.path), "status cache hit");
            return Some(entry.metadata.clone());
        }
        state.entries.remove(key);
        None
    }
}

#[async_trait]
impl<D: FilesystemDriver> FilesystemDriver for StatusCache<D> {
    async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle> {
        let handle = self.inner.open_file(path, mode).await?;
        if mode.is_writable() {
            // Opening may have created or truncated the file.
            self.state.invalidate(path);
            let state = self.state.clone();
            let path = path.to_path_buf();
            handle.set_mutation_hook(Arc::new(move || state.invalidate(&path)));
        }
        Ok(handle)
    }

    async fn execute(&self, request: FsRequest) -> Result<FsResponse> {
        let key = match &request {
            FsRequest::Status { path } => Some(CacheKey {
                path: path.clone(),
                follow_symlinks: true,
            }),
            FsRequest::LinkStatus { path } => Some(CacheKey {
                path: path.clone(),
                follow_symlinks: false,
            }),
            _ => None,
        };

        let Some(key) = key else {
            let invalidated: Vec<PathBuf> = request.invalidates().into_iter().cloned().collect();
            let response = self.inner.execute(request).await;
            // Failed requests may still have changed something.
            for path in &invalidated {
                self.state.invalidate(path);
            }
            return response;
        };

        if let Some(metadata) = self.lookup(&key) {
            return Ok(FsResponse::Status(Some(metadata)));
        }
        log_trace!(path = %display_path(&key.path), "status cache miss");

        let generation = self.state.lock().generation;
        let response = self.inner.execute(request).await?;
        if let FsResponse::Status(Some(metadata)) = &response {
            let mut state = self.state.lock();
            if state.generation == generation {
                let expires = Instant::now() + self.ttl;
                state.entries.insert(
                    key,
                    Entry {
                        metadata: metadata.clone(),
                        expires,
                    },
                );
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::InlineDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts requests reaching the wrapped driver.
    #[derive(Default)]
    struct Counting {
        inner: InlineDriver,
        executed: AtomicUsize,
    }

    #[async_trait]
    impl FilesystemDriver for Counting {
        async fn open_file(&self, path: &Path, mode: OpenMode) -> Result<FileHandle> {
            self.inner.open_file(path, mode).await
        }

        async fn execute(&self, request: FsRequest) -> Result<FsResponse> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(request).await
        }
    }

    fn status(path: &Path) -> FsRequest {
        FsRequest::Status {
            path: path.to_path_buf(),
        }
    }

    fn size_of(response: FsResponse) -> u64 {
        match response {
            FsResponse::Status(Some(metadata)) => metadata.size,
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_status_hits_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let cache = StatusCache::new(Counting::default(), Duration::from_secs(60));

        cache.execute(status(&path)).await.unwrap();
        cache.execute(status(&path)).await.unwrap();
        assert_eq!(cache.inner().executed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn missing_paths_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let cache = StatusCache::new(Counting::default(), Duration::from_secs(60));
        let missing = dir.path().join("missing");

        let response = cache.execute(status(&missing)).await.unwrap();
        assert_eq!(response, FsResponse::Status(None));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn mutations_invalidate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let cache = StatusCache::new(InlineDriver::new(), Duration::from_secs(60));

        assert_eq!(size_of(cache.execute(status(&path)).await.unwrap()), 3);
        cache
            .execute(FsRequest::Write {
                path: path.clone(),
                contents: b"abcdef".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(size_of(cache.execute(status(&path)).await.unwrap()), 6);

        let moved = dir.path().join("g");
        cache
            .execute(FsRequest::Move {
                from: path.clone(),
                to: moved.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            cache.execute(status(&path)).await.unwrap(),
            FsResponse::Status(None)
        );
    }

    #[tokio::test]
    async fn directory_invalidation_covers_children() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let child = sub.join("f");
        std::fs::write(&child, b"x").unwrap();
        let cache = StatusCache::new(InlineDriver::new(), Duration::from_secs(60));

        cache.execute(status(&child)).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache
            .execute(FsRequest::Move {
                from: sub.clone(),
                to: dir.path().join("other"),
            })
            .await
            .unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn handle_writes_invalidate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let cache = StatusCache::new(InlineDriver::new(), Duration::from_secs(60));

        let handle = cache.open_file(&path, OpenMode::Write).await.unwrap();
        assert_eq!(size_of(cache.execute(status(&path)).await.unwrap()), 0);
        handle.write("hello").await.unwrap();
        assert_eq!(size_of(cache.execute(status(&path)).await.unwrap()), 5);
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let cache = StatusCache::new(Counting::default(), Duration::from_millis(500));

        cache.execute(status(&path)).await.unwrap();
        tokio::time::advance(Duration::from_millis(499)).await;
        cache.execute(status(&path)).await.unwrap();
        assert_eq!(cache.inner().executed.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.is_empty());
        cache.execute(status(&path)).await.unwrap();
        assert_eq!(cache.inner().executed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let cache = StatusCache::new(InlineDriver::new(), Duration::from_secs(60));
        cache.execute(status(&path)).await.unwrap();
        cache
            .execute(FsRequest::LinkStatus { path: path.clone() })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
