//! Poll guard: keeps the host loop alive only while native requests are
//! outstanding.
//!
//! One [`PollGuard`] belongs to one native driver and wraps a single
//! [`Watcher`]. Every request submitted to the native provider is bracketed
//! by [`PollGuard::listen`] (before submission) and [`PollGuard::done`]
//! (inside the completion callback). The watcher is enabled exactly while at
//! least one request is outstanding.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// An event-loop watcher whose enablement keeps the loop alive.
///
/// `enable`/`disable` may be called many times; `cancel` is called once when
/// the owning guard is dropped.
pub trait Watcher: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn cancel(&self);
}

/// Reference-counted watcher enablement.
pub struct PollGuard {
    watcher: Box<dyn Watcher>,
    outstanding: Mutex<usize>,
}

impl PollGuard {
    /// Wrap a watcher. The watcher starts disabled.
    pub fn new(watcher: impl Watcher + 'static) -> Self {
        watcher.disable();
        Self {
            watcher: Box::new(watcher),
            outstanding: Mutex::new(0),
        }
    }

    /// Record a request about to be submitted.
    pub fn listen(&self) {
        let mut outstanding = self.outstanding();
        *outstanding += 1;
        if *outstanding == 1 {
            self.watcher.enable();
        }
    }

    /// Record a request whose completion has fired.
    ///
    /// # Panics
    ///
    /// Panics when called more often than [`listen`](Self::listen): a
    /// negative count would desynchronize the watcher.
    pub fn done(&self) {
        let mut outstanding = self.outstanding();
        assert!(*outstanding > 0, "PollGuard::done called without a matching listen");
        *outstanding -= 1;
        if *outstanding == 0 {
            self.watcher.disable();
        }
    }

    /// Number of requests currently outstanding.
    pub fn outstanding_requests(&self) -> usize {
        *self.outstanding()
    }

    fn outstanding(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

/// Watcher that publishes its enablement on a watch channel.
///
/// Tokio has no "loop exits when nothing is referenced" rule, so the useful
/// signal for a host is the opposite edge: [`IdleWatcher::wait_idle`] resolves
/// once no native request is outstanding.
#[derive(Clone)]
pub struct IdleWatcher {
    state: watch::Sender<WatcherState>,
}

/// Observable state of an [`IdleWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Enabled,
    Disabled,
    Cancelled,
}

impl Default for IdleWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleWatcher {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WatcherState::Disabled);
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Resolve once the watcher is disabled or cancelled.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state != WatcherState::Enabled).await;
    }
}

impl Watcher for IdleWatcher {
    fn enable(&self) {
        self.state.send_replace(WatcherState::Enabled);
    }

    fn disable(&self) {
        self.state.send_replace(WatcherState::Disabled);
    }

    fn cancel(&self) {
        self.state.send_replace(WatcherState::Cancelled);
    }
}
