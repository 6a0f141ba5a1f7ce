//! Supervised background loops.
//!
//! Cleanup, leak detection and every per-connection health loop run inside a
//! [`BackgroundTask`]: a join handle bound to its own cancellation token.
//! Starting a running task is a no-op, stopping a stopped task is a no-op,
//! and a stopped task can be started again.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A restartable, cancellable background loop.
pub struct BackgroundTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl BackgroundTask {
    /// Create a stopped task.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Spawn `body` unless the task is already running.
    ///
    /// The token handed to `body` is a child of `parent` when one is given,
    /// so cancelling the parent stops the task as well. Returns whether a new
    /// task was spawned.
    pub fn start<F, Fut>(&self, parent: Option<&CancellationToken>, body: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.launch(parent, body, tokio::spawn)
    }

    /// Like [`start`](Self::start), but spawned on `tracker` so the owner of
    /// the tracker can wait for it.
    pub fn start_on<F, Fut>(
        &self,
        tracker: &TaskTracker,
        parent: Option<&CancellationToken>,
        body: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.launch(parent, body, |fut| tracker.spawn(fut))
    }

    fn launch<F, Fut, S>(&self, parent: Option<&CancellationToken>, body: F, spawn: S) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        S: FnOnce(Fut) -> JoinHandle<()>,
    {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() && !current.token.is_cancelled() {
                return false;
            }
        }

        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let handle = spawn(body(token.clone()));
        debug!(task = self.name, "Background task started");
        *running = Some(Running { token, handle });
        true
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        running.token.cancel();
        match running.handle.await {
            Ok(()) => debug!(task = self.name, "Background task stopped"),
            Err(e) if e.is_panic() => warn!(task = self.name, "Background task panicked"),
            Err(_) => {}
        }
    }

    /// Whether the task is live.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished() && !r.token.is_cancelled())
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

/// A ticker whose first tick fires one `period` from now. Missed ticks are skipped.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
