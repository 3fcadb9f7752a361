// Loopfs worker: hosts open files for the delegated strategy in its own
// process, so a crash while touching a file only takes this process down.
//
// Reads WorkerRequest lines on stdin, answers WorkerResponse lines on stdout
// (see loopfs::worker::protocol). Stays synchronous. Exits when the parent
// closes stdin.

use std::io::{self, BufWriter};

use anyhow::Context;

fn main() -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = BufWriter::new(stdout.lock());

    loopfs::worker::serve(&mut reader, &mut writer)
        .map_err(anyhow::Error::msg)
        .context("loopfs-worker")
}
