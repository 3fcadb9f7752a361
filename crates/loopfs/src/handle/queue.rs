//! Per-handle operation queue.
//!
//! Writes and truncates are admitted immediately but executed one at a time
//! in admission order. Each admitted operation receives a [`Ticket`] holding
//! the completion signal of the operation admitted just before it (never a
//! back-reference), and a signal of its own for the one admitted after.
//! Settled operations are trimmed from the front as they finish.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// Ordered chain of pending write/truncate operations.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    pending: VecDeque<u64>,
    /// Completion signal of the most recently admitted operation.
    tail: Option<oneshot::Receiver<()>>,
    next_id: u64,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Append an operation. The returned ticket waits for its predecessor.
    pub(crate) fn admit(&mut self) -> Ticket {
        let id = self.next_id;
        self.next_id += 1;
        let (done, signal) = oneshot::channel();
        let previous = self.tail.replace(signal);
        self.pending.push_back(id);
        Ticket {
            id,
            previous,
            done: Some(done),
        }
    }

    /// Remove a settled operation from the front of the queue.
    ///
    /// Operations settle strictly in admission order, so `id` is always the
    /// front element.
    pub(crate) fn settle(&mut self, id: u64) {
        debug_assert_eq!(self.pending.front(), Some(&id), "operations settle in order");
        self.pending.retain(|pending| *pending != id);
        if self.pending.is_empty() {
            // The tail was this operation's own signal; nothing will wait on it.
            self.tail = None;
        }
    }

    /// Take the signal that fires once every admitted operation settled.
    ///
    /// Used by close: no further operation may be admitted afterwards, since
    /// it would not be chained behind the drained ones.
    pub(crate) fn drain_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.tail.take()
    }
}

/// The right to run one queued operation once its predecessor settled.
#[derive(Debug)]
pub(crate) struct Ticket {
    id: u64,
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl Ticket {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the previously admitted operation settled.
    ///
    /// The predecessor's outcome is irrelevant here: a failed write does not
    /// stop the ones queued behind it.
    pub(crate) async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // A dropped sender means the predecessor's task went away; its
            // turn is over either way.
            let _ = previous.await;
        }
    }

    /// Hand the turn to the next operation.
    pub(crate) fn finish(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
