//! Default worker pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{ProcessWorker, ThreadWorker, Worker, WorkerError, WorkerPool};
use crate::logging_impl::log_debug;

/// What the pool spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// In-process worker threads.
    Thread,
    /// `loopfs-worker` child processes.
    Process { program: PathBuf },
}

/// Spawns workers lazily up to a limit, then hands them out round-robin.
///
/// Dead workers are pruned on the next request and replaced.
pub struct LocalWorkerPool {
    kind: WorkerKind,
    limit: usize,
    workers: Mutex<Vec<Arc<dyn Worker>>>,
    next: AtomicUsize,
}

impl LocalWorkerPool {
    /// Create a pool. A `limit` of zero is treated as one.
    pub fn new(kind: WorkerKind, limit: usize) -> Self {
        Self {
            kind,
            limit: limit.max(1),
            workers: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn threads(limit: usize) -> Self {
        Self::new(WorkerKind::Thread, limit)
    }

    pub fn processes(program: impl Into<PathBuf>, limit: usize) -> Self {
        Self::new(
            WorkerKind::Process {
                program: program.into(),
            },
            limit,
        )
    }

    /// Live workers spawned so far.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|worker| worker.is_running())
            .count()
    }

    fn spawn_worker(&self) -> Result<Arc<dyn Worker>, WorkerError> {
        let worker: Arc<dyn Worker> = match &self.kind {
            WorkerKind::Thread => Arc::new(ThreadWorker::spawn()?),
            WorkerKind::Process { program } => Arc::new(ProcessWorker::spawn(program)?),
        };
        Ok(worker)
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn get_worker(&self) -> Result<Arc<dyn Worker>, WorkerError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = workers.len();
        workers.retain(|worker| worker.is_running());
        if workers.len() < before {
            log_debug!(pruned = before - workers.len(), "pruned dead workers from pool");
        }

        if workers.len() < self.limit {
            let worker = self.spawn_worker()?;
            workers.push(Arc::clone(&worker));
            return Ok(worker);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(Arc::clone(&workers[index]))
    }
}
