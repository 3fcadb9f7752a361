//! Tasks executed by workers.

use std::collections::HashMap;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::RemoteError;
use crate::error::{Error, Result};
use crate::metadata::{FsRequest, FsResponse};
use crate::mode::OpenMode;
use crate::sys;

/// One unit of work for a worker. Open files are named by the id the
/// worker returned from `Open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum FileTask {
    Open {
        path: PathBuf,
        mode: OpenMode,
    },
    Read {
        file: u64,
        offset: u64,
        length: usize,
    },
    Write {
        file: u64,
        offset: u64,
        #[serde(with = "super::protocol::base64_bytes")]
        data: Vec<u8>,
    },
    Truncate {
        file: u64,
        size: u64,
    },
    Close {
        file: u64,
    },
    Path {
        request: FsRequest,
    },
}

impl FileTask {
    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Truncate { .. } => "truncate",
            Self::Close { .. } => "close",
            Self::Path { .. } => "path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Opened {
        file: u64,
        size: u64,
    },
    Data(#[serde(with = "super::protocol::base64_bytes")] Vec<u8>),
    Done,
    Path(FsResponse),
}

/// The open-file table of one worker.
///
/// Synchronous: thread workers call it from their own thread and the
/// subprocess worker from its main loop.
#[derive(Debug, Default)]
pub struct TaskRunner {
    files: HashMap<u64, File>,
    next_file: u64,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently open on this worker.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Run one task. A panicking task fails alone; the worker and its other
    /// files stay usable.
    pub fn run(&mut self, task: FileTask) -> std::result::Result<TaskOutcome, RemoteError> {
        let name = task.name();
        panic::catch_unwind(AssertUnwindSafe(|| self.run_inner(task)))
            .unwrap_or_else(|_| Err(Error::Stream(format!("{name} task panicked"))))
            .map_err(RemoteError::from)
    }

    fn run_inner(&mut self, task: FileTask) -> Result<TaskOutcome> {
        match task {
            FileTask::Open { path, mode } => {
                let (file, size) = sys::open(&path, mode)?;
                self.next_file += 1;
                self.files.insert(self.next_file, file);
                Ok(TaskOutcome::Opened {
                    file: self.next_file,
                    size,
                })
            }
            FileTask::Read {
                file,
                offset,
                length,
            } => {
                let data = sys::read_at(self.file(file)?, offset, length).map_err(Error::stream)?;
                Ok(TaskOutcome::Data(data))
            }
            FileTask::Write { file, offset, data } => {
                sys::write_all_at(self.file(file)?, offset, &data).map_err(Error::stream)?;
                Ok(TaskOutcome::Done)
            }
            FileTask::Truncate { file, size } => {
                sys::truncate(self.file(file)?, size).map_err(Error::stream)?;
                Ok(TaskOutcome::Done)
            }
            FileTask::Close { file } => {
                self.files.remove(&file).ok_or(Error::Closed)?;
                Ok(TaskOutcome::Done)
            }
            FileTask::Path { request } => sys::execute(request).map(TaskOutcome::Path),
        }
    }

    fn file(&self, id: u64) -> Result<&File> {
        self.files.get(&id).ok_or(Error::Closed)
    }
}
