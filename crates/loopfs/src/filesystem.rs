//! Filesystem façade.
//!
//! [`Filesystem`] is what applications hold: a typed API over whichever
//! [`FilesystemDriver`] was selected. Whole-path calls fail with
//! [`Error::Filesystem`](crate::Error::Filesystem); I/O on the returned
//! handles follows the handle rules.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::backend::{DelegatedDriver, FilesystemDriver, InlineDriver, NativeDriver};
use crate::cache::StatusCache;
use crate::config::{DriverKind, FsConfig};
use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::logging_impl::{display_path, log_info};
use crate::metadata::{FsRequest, FsResponse, Metadata};
use crate::mode::OpenMode;
use crate::poll::IdleWatcher;
use crate::worker::{LocalWorkerPool, WorkerPool};

/// Entry point for file access.
///
/// Cheap to clone; clones share the driver.
#[derive(Clone)]
pub struct Filesystem {
    driver: Arc<dyn FilesystemDriver>,
    idle: Option<IdleWatcher>,
}

impl Filesystem {
    pub fn new(driver: impl FilesystemDriver + 'static) -> Self {
        Self::from_driver(Arc::new(driver))
    }

    pub fn from_driver(driver: Arc<dyn FilesystemDriver>) -> Self {
        Self { driver, idle: None }
    }

    /// Build the driver described by `config`.
    ///
    /// # Errors
    /// - `Config` for invalid limits, or a native driver requested outside
    ///   a Tokio runtime
    pub fn from_config(config: &FsConfig) -> Result<Self> {
        config.validate()?;
        let ttl = config.cache_ttl();
        let kind = config.resolved_driver();
        let mut idle = None;
        let driver = match kind {
            DriverKind::Inline | DriverKind::Auto => with_cache(InlineDriver::new(), ttl),
            DriverKind::Native => {
                let (driver, watcher) = NativeDriver::current()?;
                idle = Some(watcher);
                with_cache(driver, ttl)
            }
            DriverKind::Delegated => {
                let pool: Arc<dyn WorkerPool> = match &config.worker_program {
                    Some(program) => {
                        Arc::new(LocalWorkerPool::processes(program.clone(), config.pool_limit))
                    }
                    None => Arc::new(LocalWorkerPool::threads(config.pool_limit)),
                };
                with_cache(DelegatedDriver::new(pool, config.worker_limit), ttl)
            }
        };
        log_info!(driver = ?kind, cache_ttl = ?ttl, "filesystem driver selected");
        Ok(Self { driver, idle })
    }

    /// Build from the default configuration.
    ///
    /// # Errors
    /// See [`from_config`](Self::from_config).
    pub fn from_default_config() -> Result<Self> {
        Self::from_config(&FsConfig::default())
    }

    pub fn driver(&self) -> &Arc<dyn FilesystemDriver> {
        &self.driver
    }

    /// Attach the watcher of a native driver built by hand.
    pub fn with_idle_watcher(mut self, watcher: IdleWatcher) -> Self {
        self.idle = Some(watcher);
        self
    }

    /// Watcher that is enabled while native requests are outstanding.
    ///
    /// `None` unless the driver is native.
    pub fn idle_watcher(&self) -> Option<&IdleWatcher> {
        self.idle.as_ref()
    }

    pub async fn open_file(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<FileHandle> {
        self.driver.open_file(path.as_ref(), mode).await
    }

    /// Open with a mode string (`"r"`, `"w+"`, `"ab"`, ...).
    ///
    /// # Errors
    /// - `InvalidMode` for an unknown mode string
    /// - `Filesystem` if the file cannot be opened
    pub async fn open(&self, path: impl AsRef<Path>, mode: &str) -> Result<FileHandle> {
        let mode: OpenMode = mode.parse()?;
        self.open_file(path, mode).await
    }

    /// Read a whole file.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Bytes> {
        match self.run(FsRequest::Read { path: owned(path) }).await? {
            FsResponse::Contents(contents) => Ok(Bytes::from(contents)),
            other => Err(unexpected(&other)),
        }
    }

    /// Replace a whole file, creating it if needed.
    pub async fn write(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Result<()> {
        self.run_done(FsRequest::Write {
            path: owned(path),
            contents: contents.into(),
        })
        .await
    }

    /// Status following symlinks; `None` if the path does not exist.
    pub async fn status(&self, path: impl AsRef<Path>) -> Result<Option<Metadata>> {
        self.run_status(FsRequest::Status { path: owned(path) }).await
    }

    /// Status of the path itself, without following a final symlink.
    pub async fn link_status(&self, path: impl AsRef<Path>) -> Result<Option<Metadata>> {
        self.run_status(FsRequest::LinkStatus { path: owned(path) }).await
    }

    pub async fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.status(path).await?.is_some())
    }

    pub async fn is_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self
            .status(path)
            .await?
            .is_some_and(|meta| meta.file_type.is_file()))
    }

    pub async fn is_directory(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self
            .status(path)
            .await?
            .is_some_and(|meta| meta.file_type.is_dir()))
    }

    pub async fn is_symlink(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self
            .link_status(path)
            .await?
            .is_some_and(|meta| meta.file_type.is_symlink()))
    }

    /// Size in bytes.
    ///
    /// # Errors
    /// - `Filesystem` if the path does not exist
    pub async fn size(&self, path: impl AsRef<Path>) -> Result<u64> {
        Ok(self.existing_status("size", path.as_ref()).await?.size)
    }

    /// Last modification time.
    ///
    /// # Errors
    /// - `Filesystem` if the path does not exist
    pub async fn modification_time(&self, path: impl AsRef<Path>) -> Result<SystemTime> {
        Ok(self
            .existing_status("modification time", path.as_ref())
            .await?
            .modified)
    }

    /// Create the file if missing and set its modification time to now.
    pub async fn touch(&self, path: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::Touch { path: owned(path) }).await
    }

    pub async fn delete_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::DeleteFile { path: owned(path) })
            .await
    }

    pub async fn move_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::Move {
            from: owned(from),
            to: owned(to),
        })
        .await
    }

    /// Create one directory; its parent must exist.
    pub async fn create_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::CreateDirectory {
            path: owned(path),
            recursive: false,
        })
        .await
    }

    /// Create a directory and any missing parents.
    pub async fn create_directory_recursively(&self, path: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::CreateDirectory {
            path: owned(path),
            recursive: true,
        })
        .await
    }

    /// Remove an empty directory.
    pub async fn delete_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        self.run_done(FsRequest::DeleteDirectory { path: owned(path) })
            .await
    }

    /// Entry names of a directory, sorted.
    pub async fn list_files(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        match self.run(FsRequest::ListFiles { path: owned(path) }).await? {
            FsResponse::Names(names) => Ok(names),
            other => Err(unexpected(&other)),
        }
    }

    /// Set permission bits (e.g. `0o644`).
    pub async fn change_permissions(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        self.run_done(FsRequest::ChangePermissions {
            path: owned(path),
            mode,
        })
        .await
    }

    /// Create `link` pointing at `target`.
    pub async fn create_symlink(
        &self,
        target: impl AsRef<Path>,
        link: impl AsRef<Path>,
    ) -> Result<()> {
        self.run_done(FsRequest::CreateSymlink {
            target: owned(target),
            link: owned(link),
        })
        .await
    }

    /// Target of a symlink, as stored.
    pub async fn resolve_symlink(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        match self
            .run(FsRequest::ResolveSymlink { path: owned(path) })
            .await?
        {
            FsResponse::Path(target) => Ok(target),
            other => Err(unexpected(&other)),
        }
    }

    async fn run(&self, request: FsRequest) -> Result<FsResponse> {
        self.driver.execute(request).await
    }

    async fn run_done(&self, request: FsRequest) -> Result<()> {
        match self.run(request).await? {
            FsResponse::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn run_status(&self, request: FsRequest) -> Result<Option<Metadata>> {
        match self.run(request).await? {
            FsResponse::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    async fn existing_status(&self, action: &str, path: &Path) -> Result<Metadata> {
        self.status(path).await?.ok_or_else(|| {
            Error::Filesystem(format!("{action} {}: no such file or directory", display_path(path)))
        })
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem").finish_non_exhaustive()
    }
}

fn with_cache<D: FilesystemDriver + 'static>(
    driver: D,
    ttl: Option<Duration>,
) -> Arc<dyn FilesystemDriver> {
    match ttl {
        Some(ttl) => Arc::new(StatusCache::new(driver, ttl)),
        None => Arc::new(driver),
    }
}

fn owned(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().to_path_buf()
}

fn unexpected(response: &FsResponse) -> Error {
    Error::Filesystem(format!("unexpected response: {response:?}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::poll::WatcherState;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn inline() -> Filesystem {
        Filesystem::new(InlineDriver::new())
    }

    #[tokio::test]
    async fn whole_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let fs = inline();
        let path = dir.path().join("f.txt");

        fs.write(&path, "contents").await.unwrap();
        assert_eq!(&fs.read(&path).await.unwrap()[..], b"contents");
        assert_eq!(fs.size(&path).await.unwrap(), 8);
        assert!(fs.is_file(&path).await.unwrap());
        assert!(!fs.is_directory(&path).await.unwrap());
    }

    #[tokio::test]
    async fn missing_paths() {
        let dir = TempDir::new().unwrap();
        let fs = inline();
        let missing = dir.path().join("missing");

        assert!(fs.status(&missing).await.unwrap().is_none());
        assert!(!fs.exists(&missing).await.unwrap());
        assert!(matches!(fs.size(&missing).await, Err(Error::Filesystem(_))));
        assert!(matches!(
            fs.delete_file(&missing).await,
            Err(Error::Filesystem(_))
        ));
    }

    #[tokio::test]
    async fn directories_and_moves() {
        let dir = TempDir::new().unwrap();
        let fs = inline();
        let nested = dir.path().join("a/b");

        assert!(fs.create_directory(&nested).await.is_err());
        fs.create_directory_recursively(&nested).await.unwrap();
        fs.touch(nested.join("one")).await.unwrap();
        fs.move_file(nested.join("one"), nested.join("two"))
            .await
            .unwrap();
        assert_eq!(fs.list_files(&nested).await.unwrap(), vec!["two"]);

        fs.delete_file(nested.join("two")).await.unwrap();
        fs.delete_directory(&nested).await.unwrap();
        assert!(!fs.exists(&nested).await.unwrap());
    }

    #[tokio::test]
    async fn open_parses_mode_strings() {
        let dir = TempDir::new().unwrap();
        let fs = inline();
        let handle = fs.open(dir.path().join("f"), "wb").await.unwrap();
        assert_eq!(handle.mode(), OpenMode::Write);
        handle.close().await;

        assert!(matches!(
            fs.open(dir.path().join("f"), "q").await,
            Err(Error::InvalidMode(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_and_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let fs = inline();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs.write(&target, "x").await.unwrap();
        fs.create_symlink(&target, &link).await.unwrap();

        assert!(fs.is_symlink(&link).await.unwrap());
        assert!(!fs.is_symlink(&target).await.unwrap());
        assert_eq!(fs.resolve_symlink(&link).await.unwrap(), target);

        fs.change_permissions(&target, 0o600).await.unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn modification_time_moves_forward_on_touch() {
        let dir = TempDir::new().unwrap();
        let fs = inline();
        let path = dir.path().join("f");
        fs.touch(&path).await.unwrap();
        let first = fs.modification_time(&path).await.unwrap();
        assert!(first <= SystemTime::now());
    }

    #[tokio::test]
    async fn from_config_builds_each_driver() {
        let dir = TempDir::new().unwrap();
        for kind in [
            DriverKind::Auto,
            DriverKind::Inline,
            DriverKind::Native,
            DriverKind::Delegated,
        ] {
            let config = FsConfig::new().driver(kind).worker_limit(2).pool_limit(2);
            let fs = Filesystem::from_config(&config).unwrap();
            let path = dir.path().join(format!("{kind:?}"));
            fs.write(&path, "ok").await.unwrap();
            assert_eq!(&fs.read(&path).await.unwrap()[..], b"ok");
        }
    }

    #[tokio::test]
    async fn native_config_exposes_idle_watcher() {
        let dir = TempDir::new().unwrap();
        let config = FsConfig::new().driver(DriverKind::Native);
        let fs = Filesystem::from_config(&config).unwrap();
        let watcher = fs.idle_watcher().unwrap().clone();

        let path = dir.path().join("f");
        fs.write(&path, "data").await.unwrap();
        watcher.wait_idle().await;
        assert_eq!(watcher.state(), WatcherState::Disabled);

        let inline = Filesystem::from_config(&FsConfig::new().driver(DriverKind::Inline)).unwrap();
        assert!(inline.idle_watcher().is_none());
    }

    #[test]
    fn native_without_runtime_is_config_error() {
        let config = FsConfig::new().driver(DriverKind::Native);
        assert!(matches!(
            Filesystem::from_config(&config),
            Err(Error::Config(_))
        ));
    }
}
