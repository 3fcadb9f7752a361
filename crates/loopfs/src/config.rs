//! Filesystem configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum number of distinct workers hosting open files: 8
pub const DEFAULT_WORKER_LIMIT: usize = 8;

/// Default maximum number of workers the pool spawns: 32
pub const DEFAULT_POOL_LIMIT: usize = 32;

/// Default status cache TTL: 1 second
pub const DEFAULT_STATUS_CACHE_TTL_MS: u64 = 1_000;

/// Which execution strategy backs the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// `Native` inside a Tokio runtime, `Inline` otherwise.
    #[default]
    Auto,
    Inline,
    Native,
    Delegated,
}

/// Filesystem configuration.
///
/// # Example
///
/// ```rust
/// use loopfs::{DriverKind, FsConfig};
///
/// let config = FsConfig::new()
///     .driver(DriverKind::Delegated)
///     .worker_limit(4)
///     .status_cache_ttl(None);
/// assert_eq!(config.worker_limit, 4);
/// ```
///
/// # Defaults
///
/// | Setting | Default | Purpose |
/// |---------|---------|---------|
/// | `driver` | `auto` | Execution strategy |
/// | `worker_limit` | 8 | Distinct workers hosting open files |
/// | `pool_limit` | 32 | Workers the pool may spawn |
/// | `worker_program` | none | Subprocess worker binary; threads when unset |
/// | `status_cache_ttl_ms` | 1000 | Status cache TTL; `null` disables the cache |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub driver: DriverKind,

    /// Maximum number of distinct workers hosting open files.
    pub worker_limit: usize,

    /// Maximum number of workers the pool spawns.
    pub pool_limit: usize,

    /// Path to the `loopfs-worker` binary. Delegated workers are
    /// subprocesses when set and threads otherwise.
    pub worker_program: Option<PathBuf>,

    /// Status cache TTL in milliseconds. `None` disables the cache.
    pub status_cache_ttl_ms: Option<u64>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Auto,
            worker_limit: DEFAULT_WORKER_LIMIT,
            pool_limit: DEFAULT_POOL_LIMIT,
            worker_program: None,
            status_cache_ttl_ms: Some(DEFAULT_STATUS_CACHE_TTL_MS),
        }
    }
}

impl FsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    /// - `Config` for malformed JSON or invalid values
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| Error::Config(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that limits are usable.
    ///
    /// # Errors
    /// - `Config` when a limit is zero or the worker limit exceeds the pool
    pub fn validate(&self) -> Result<()> {
        if self.worker_limit == 0 {
            return Err(Error::Config("worker_limit must be at least 1".into()));
        }
        if self.pool_limit == 0 {
            return Err(Error::Config("pool_limit must be at least 1".into()));
        }
        if self.worker_limit > self.pool_limit {
            return Err(Error::Config(format!(
                "worker_limit ({}) exceeds pool_limit ({})",
                self.worker_limit, self.pool_limit
            )));
        }
        Ok(())
    }

    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit;
        self
    }

    pub fn pool_limit(mut self, limit: usize) -> Self {
        self.pool_limit = limit;
        self
    }

    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn status_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.status_cache_ttl_ms =
            ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Status cache TTL, if the cache is enabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.status_cache_ttl_ms.map(Duration::from_millis)
    }

    /// The strategy `Auto` stands for in the current context.
    pub fn resolved_driver(&self) -> DriverKind {
        match self.driver {
            DriverKind::Auto if tokio::runtime::Handle::try_current().is_ok() => {
                DriverKind::Native
            }
            DriverKind::Auto => DriverKind::Inline,
            other => other,
        }
    }
}
