//! The future returned by handle operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Outcome of an operation that was already admitted and started.
///
/// The operation runs whether or not this future is polled; dropping it only
/// discards the outcome. Awaiting it yields the operation's own result, so
/// callers that queued several writes observe each outcome separately.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Pair a completion with the sender its task resolves.
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved, used for calls refused at
    /// admission.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(result);
        completion
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                // The task driving the operation was torn down with the runtime.
                Err(Error::Stream("operation abandoned before completion".into()))
            })
        })
    }
}
