//! Workers backed by a dedicated OS thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{FileTask, RemoteError, TaskOutcome, TaskRunner, Worker, WorkerError, WorkerId};
use crate::logging_impl::log_debug;

type Reply = oneshot::Sender<Result<TaskOutcome, RemoteError>>;

struct Job {
    task: FileTask,
    reply: Reply,
}

/// A worker running its [`TaskRunner`] on its own thread.
pub struct ThreadWorker {
    id: WorkerId,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    running: Arc<AtomicBool>,
}

impl ThreadWorker {
    /// Start the worker thread.
    pub fn spawn() -> Result<Self, WorkerError> {
        let id = super::next_worker_id();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let running = Arc::new(AtomicBool::new(true));

        let stopped = StopOnExit(Arc::clone(&running));
        std::thread::Builder::new()
            .name(format!("loopfs-worker-{id}"))
            .spawn(move || {
                let stopped = stopped;
                let mut runner = TaskRunner::new();
                while let Some(job) = queue.blocking_recv() {
                    if !stopped.0.load(Ordering::SeqCst) {
                        // Killed: the dropped reply reports the exit.
                        break;
                    }
                    let _ = job.reply.send(runner.run(job.task));
                }
            })
            .map_err(|err| WorkerError::Failure(format!("spawn worker thread: {err}")))?;

        log_debug!(worker = id, "started thread worker");
        Ok(Self {
            id,
            jobs: Mutex::new(Some(jobs)),
            running,
        })
    }

    /// Stop the worker as if it had died. Queued and later tasks fail with
    /// [`WorkerError::Exited`].
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn submit(&self, job: Job) -> Result<(), WorkerError> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = jobs.as_ref().ok_or(WorkerError::Exited)?;
        sender.send(job).map_err(|_| WorkerError::Exited)
    }
}

impl fmt::Debug for ThreadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorker")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl Worker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        task: FileTask,
        cancel: Option<CancellationToken>,
    ) -> Result<TaskOutcome, WorkerError> {
        let (reply, answer) = oneshot::channel();
        self.submit(Job { task, reply })?;
        let answer = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(WorkerError::Cancelled),
                    answer = answer => answer,
                }
            }
            None => answer.await,
        };
        answer
            .map_err(|_| WorkerError::Exited)?
            .map_err(WorkerError::Task)
    }
}

/// Clears the running flag when the worker thread ends, panics included.
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mode::OpenMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn executes_tasks_on_its_thread() {
        let dir = TempDir::new().unwrap();
        let worker = ThreadWorker::spawn().unwrap();
        let outcome = worker
            .execute(
                FileTask::Open {
                    path: dir.path().join("f"),
                    mode: OpenMode::Write,
                },
                None,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::Opened { size: 0, .. }));
        assert!(worker.is_running());
    }

    #[tokio::test]
    async fn killed_worker_reports_exit() {
        let worker = ThreadWorker::spawn().unwrap();
        worker.kill();
        assert!(!worker.is_running());
        let err = worker
            .execute(FileTask::Close { file: 1 }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Exited));
    }

    #[tokio::test]
    async fn task_failures_are_remote_errors() {
        let worker = ThreadWorker::spawn().unwrap();
        let err = worker
            .execute(FileTask::Close { file: 42 }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Task(_)));
    }

    #[tokio::test]
    async fn cancelled_wait_returns_early() {
        let worker = ThreadWorker::spawn().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = worker
            .execute(FileTask::Close { file: 1 }, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
    }
}
