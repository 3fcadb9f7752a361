// Wire protocol between the parent and `loopfs-worker` subprocesses.
// JSON lines over stdin/stdout. The worker stays synchronous (no tokio).
//
// Flow:
//   Parent -> Worker: WorkerRequest { id, task }
//   Worker -> Parent: WorkerResponse { id, result }
//   ... any number of requests, answered in order ...
//
// The parent tags every request with an id and routes responses by it. EOF
// on the worker's stdout means the worker is gone.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use super::{FileTask, RemoteError, TaskOutcome, TaskRunner};

/// Parent -> Worker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub task: FileTask,
}

/// Worker -> Parent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub result: Result<TaskOutcome, RemoteError>,
}

/// Read one JSON line from a reader. Returns None on EOF.
pub fn read_message<T: serde::de::DeserializeOwned>(
    reader: &mut impl BufRead,
) -> Result<Option<T>, String> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => Ok(None),
        Ok(_) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| format!("protocol error: {e}: {:?}", preview(&line))),
        Err(e) => Err(format!("read error: {e}")),
    }
}

/// Write one JSON line to a writer.
pub fn write_message<T: Serialize>(writer: &mut impl Write, msg: &T) -> Result<(), String> {
    serde_json::to_writer(&mut *writer, msg).map_err(|e| format!("serialize error: {e}"))?;
    writer
        .write_all(b"\n")
        .map_err(|e| format!("write error: {e}"))?;
    writer.flush().map_err(|e| format!("flush error: {e}"))
}

/// Worker main loop: answer requests until the parent closes the pipe.
pub fn serve(reader: &mut impl BufRead, writer: &mut impl Write) -> Result<(), String> {
    let mut runner = TaskRunner::new();
    while let Some(WorkerRequest { id, task }) = read_message(reader)? {
        let result = runner.run(task);
        write_message(writer, &WorkerResponse { id, result })?;
    }
    Ok(())
}

fn preview(line: &str) -> &str {
    let mut end = line.len().min(200);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

/// Serde helper encoding byte payloads as base64 strings.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(
        bytes: T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        B64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
