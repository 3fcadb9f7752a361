//! Worker selection for newly opened files.
//!
//! The scheduler keeps a load table of the workers currently hosting open
//! files. Below the limit it asks the pool for a worker; at the limit it
//! reuses the least-loaded tracked worker. A worker leaves the table when
//! its last file closes or when it turns out to be dead, so the table never
//! grows past the limit.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Worker, WorkerError, WorkerId, WorkerPool};
use crate::logging_impl::log_debug;

struct Tracked {
    worker: Arc<dyn Worker>,
    in_use: usize,
}

type LoadTable = Arc<Mutex<Vec<Tracked>>>;

fn lock(table: &Mutex<Vec<Tracked>>) -> MutexGuard<'_, Vec<Tracked>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounds the number of distinct workers hosting open files.
pub struct WorkerScheduler {
    pool: Arc<dyn WorkerPool>,
    limit: usize,
    /// Serializes growth so concurrent opens cannot overshoot the limit.
    growth: tokio::sync::Mutex<()>,
    workers: LoadTable,
}

impl WorkerScheduler {
    /// A `limit` of zero is treated as one.
    pub fn new(pool: Arc<dyn WorkerPool>, limit: usize) -> Self {
        Self {
            pool,
            limit: limit.max(1),
            growth: tokio::sync::Mutex::new(()),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Workers currently hosting at least one open file.
    pub fn tracked_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Open files per tracked worker, in the order workers were first seen.
    pub fn load(&self) -> Vec<(WorkerId, usize)> {
        lock(&self.workers)
            .iter()
            .map(|tracked| (tracked.worker.id(), tracked.in_use))
            .collect()
    }

    /// Pick a worker for a new file.
    ///
    /// The returned lease counts as one open file on the worker until it is
    /// dropped.
    pub async fn select_worker(&self) -> Result<WorkerLease, WorkerError> {
        let _growth = self.growth.lock().await;
        loop {
            if lock(&self.workers).len() < self.limit {
                let worker = self.pool.get_worker().await?;
                let mut workers = lock(&self.workers);
                match workers.iter_mut().find(|t| t.worker.id() == worker.id()) {
                    Some(tracked) => tracked.in_use += 1,
                    None => workers.push(Tracked {
                        worker: Arc::clone(&worker),
                        in_use: 1,
                    }),
                }
                log_debug!(worker = worker.id(), tracked = workers.len(), "selected worker");
                return Ok(self.lease(worker));
            }

            let mut workers = lock(&self.workers);
            let Some(index) = (0..workers.len()).min_by_key(|&i| workers[i].in_use) else {
                continue;
            };
            if !workers[index].worker.is_running() {
                let dead = workers.remove(index);
                log_debug!(worker = dead.worker.id(), "evicted dead worker");
                continue;
            }
            workers[index].in_use += 1;
            let worker = Arc::clone(&workers[index].worker);
            log_debug!(worker = worker.id(), in_use = workers[index].in_use, "reused worker");
            return Ok(self.lease(worker));
        }
    }

    fn lease(&self, worker: Arc<dyn Worker>) -> WorkerLease {
        WorkerLease {
            worker,
            workers: Arc::clone(&self.workers),
        }
    }
}

impl fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("limit", &self.limit)
            .field("load", &self.load())
            .finish()
    }
}

/// One open file's claim on a worker. Dropping it releases the claim.
pub struct WorkerLease {
    worker: Arc<dyn Worker>,
    workers: LoadTable,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.worker.id())
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let id = self.worker.id();
        let mut workers = lock(&self.workers);
        let Some(index) = workers.iter().position(|t| t.worker.id() == id) else {
            // Already evicted as dead.
            return;
        };
        let tracked = &mut workers[index];
        tracked.in_use = tracked.in_use.saturating_sub(1);
        if tracked.in_use == 0 || !tracked.worker.is_running() {
            workers.remove(index);
            log_debug!(worker = id, "released worker");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::worker::{FileTask, TaskOutcome};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FakeWorker {
        id: WorkerId,
        running: AtomicBool,
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn execute(
            &self,
            _task: FileTask,
            _cancel: Option<CancellationToken>,
        ) -> Result<TaskOutcome, WorkerError> {
            Ok(TaskOutcome::Done)
        }
    }

    /// Hands out a fresh worker on every call and remembers them all.
    #[derive(Default)]
    struct FreshPool {
        spawned: Mutex<Vec<Arc<FakeWorker>>>,
    }

    #[async_trait]
    impl WorkerPool for FreshPool {
        async fn get_worker(&self) -> Result<Arc<dyn Worker>, WorkerError> {
            let mut spawned = self.spawned.lock().unwrap();
            let worker = Arc::new(FakeWorker {
                id: spawned.len() as WorkerId + 1,
                running: AtomicBool::new(true),
            });
            spawned.push(Arc::clone(&worker));
            Ok(worker)
        }
    }

    fn scheduler(limit: usize) -> (WorkerScheduler, Arc<FreshPool>) {
        let pool = Arc::new(FreshPool::default());
        (WorkerScheduler::new(pool.clone(), limit), pool)
    }

    #[tokio::test]
    async fn never_tracks_more_than_limit() {
        let (scheduler, _pool) = scheduler(3);
        let mut leases = Vec::new();
        for _ in 0..7 {
            leases.push(scheduler.select_worker().await.unwrap());
            assert!(scheduler.tracked_workers() <= 3);
        }
        assert_eq!(scheduler.load(), vec![(1, 3), (2, 2), (3, 2)]);

        leases.clear();
        assert_eq!(scheduler.tracked_workers(), 0);
    }

    #[tokio::test]
    async fn reuses_least_loaded_worker() {
        let (scheduler, _pool) = scheduler(2);
        let a = scheduler.select_worker().await.unwrap();
        let b = scheduler.select_worker().await.unwrap();
        let c = scheduler.select_worker().await.unwrap();
        assert_eq!(c.worker().id(), a.worker().id());
        drop(a);
        drop(c);
        // Worker 1 went idle and left the table; a new one takes its slot.
        let d = scheduler.select_worker().await.unwrap();
        assert_eq!(d.worker().id(), 3);
        assert_eq!(scheduler.load(), vec![(2, 1), (3, 1)]);
        drop(b);
    }

    #[tokio::test]
    async fn dead_worker_is_evicted_on_selection() {
        let (scheduler, pool) = scheduler(1);
        let first = scheduler.select_worker().await.unwrap();
        pool.spawned.lock().unwrap()[0]
            .running
            .store(false, Ordering::SeqCst);

        let second = scheduler.select_worker().await.unwrap();
        assert_eq!(second.worker().id(), 2);
        assert_eq!(scheduler.load(), vec![(2, 1)]);

        // Releasing the lease on the evicted worker leaves the table alone.
        drop(first);
        assert_eq!(scheduler.load(), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn concurrent_selection_respects_limit() {
        let (scheduler, _pool) = scheduler(4);
        let scheduler = Arc::new(scheduler);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move { scheduler.select_worker().await.unwrap() })
            })
            .collect();
        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.unwrap());
        }
        assert_eq!(scheduler.tracked_workers(), 4);
        assert!(scheduler.load().iter().all(|(_, n)| *n == 4));
    }
}
