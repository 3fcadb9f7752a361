//! Workers backed by a `loopfs-worker` child process.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::protocol::{WorkerRequest, WorkerResponse};
use super::{FileTask, RemoteError, TaskOutcome, Worker, WorkerError, WorkerId};
use crate::logging_impl::{display_path, log_debug, log_warn};

type Reply = oneshot::Sender<Result<TaskOutcome, RemoteError>>;
type Answer = oneshot::Receiver<Result<TaskOutcome, RemoteError>>;

/// State shared with the reader and writer tasks.
struct Shared {
    id: WorkerId,
    running: AtomicBool,
    pending: Mutex<HashMap<u64, Reply>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the worker dead and fail everything in flight.
    fn mark_exited(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log_warn!(worker = self.id, "worker process exited");
        }
        // Dropping the replies resolves every waiter with `Exited`.
        self.pending().clear();
    }
}

/// A worker hosting its files in a child process.
///
/// Requests are written as JSON lines by a writer task, so a caller that
/// stops waiting never leaves a partial line on the pipe. A reader task
/// routes responses by request id; EOF marks the worker dead.
pub struct ProcessWorker {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Vec<u8>>,
    next_request: AtomicU64,
    child: Mutex<Child>,
}

impl ProcessWorker {
    /// Start `program` and attach to its stdin/stdout. Must be called from
    /// within a Tokio runtime.
    pub fn spawn(program: &Path) -> Result<Self, WorkerError> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                WorkerError::Failure(format!("spawn {}: {err}", display_path(program)))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Failure("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Failure("worker stdout unavailable".into()))?;

        let shared = Arc::new(Shared {
            id: super::next_worker_id(),
            running: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
        });
        let (requests, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(Arc::clone(&shared), stdin, outgoing));
        tokio::spawn(read_responses(Arc::clone(&shared), stdout));

        log_debug!(
            worker = shared.id,
            pid = ?child.id(),
            program = %display_path(program),
            "started process worker"
        );
        Ok(Self {
            shared,
            requests,
            next_request: AtomicU64::new(1),
            child: Mutex::new(child),
        })
    }

    /// Kill the child process.
    pub fn kill(&self) -> std::io::Result<()> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_kill()
    }

    fn send(&self, task: FileTask) -> Result<(u64, Answer), WorkerError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&WorkerRequest { id, task })
            .map_err(|err| WorkerError::Failure(format!("serialize error: {err}")))?;
        line.push(b'\n');

        let (reply, answer) = oneshot::channel();
        self.shared.pending().insert(id, reply);
        // The reader clears the table after flipping the flag, so checking
        // here catches a death that raced with the insert.
        if !self.is_running() || self.requests.send(line).is_err() {
            self.shared.pending().remove(&id);
            return Err(WorkerError::Exited);
        }
        Ok((id, answer))
    }
}

impl fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("id", &self.shared.id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.shared.id
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        task: FileTask,
        cancel: Option<CancellationToken>,
    ) -> Result<TaskOutcome, WorkerError> {
        let (id, answer) = self.send(task)?;
        let answer = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.shared.pending().remove(&id);
                        return Err(WorkerError::Cancelled);
                    }
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

async fn write_requests(
    shared: Arc<Shared>,
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(line) = outgoing.recv().await {
        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        if let Err(err) = written.await {
            log_warn!(worker = shared.id, error = %err, "failed to write to worker");
            shared.mark_exited();
            return;
        }
    }
}

async fn read_responses(shared: Arc<Shared>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerResponse>(&line) {
                Ok(WorkerResponse { id, result }) => {
                    if let Some(reply) = shared.pending().remove(&id) {
                        let _ = reply.send(result);
                    }
                }
                Err(err) => {
                    log_warn!(worker = shared.id, error = %err, "malformed worker response");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                log_warn!(worker = shared.id, error = %err, "failed to read from worker");
                break;
            }
        }
    }
    shared.mark_exited();
}
