//! Cooperative stop handling for network loops.
//!
//! Every network-facing loop runs on its own task and waits on its socket
//! with a bounded timeout. Stopping flips a shared running flag and wakes
//! any pending wait; the owner then joins the task with a bounded wait and
//! abandons it (with a warning) if it does not exit in time.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shared running flag plus wake-up for tasks blocked on a socket.
#[derive(Clone, Debug)]
pub struct StopSignal {
    // ---
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            running: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flips the running flag and wakes every pending wait.
    pub fn stop(&self) {
        // ---
        self.running.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves once [`StopSignal::stop`] has been called.
    pub async fn stopped(&self) {
        // ---
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a bounded wait.
#[derive(Debug)]
pub enum Wake<T> {
    /// The awaited operation completed.
    Ready(T),

    /// The bounded wait elapsed. Not an error: the loop re-checks its flag.
    TimedOut,

    /// Stop was requested while waiting.
    Stopped,
}

/// Awaits `fut` for at most `timeout`, returning early if `signal` stops.
pub async fn wait_or_stop<F>(signal: &StopSignal, timeout: Duration, fut: F) -> Wake<F::Output>
where
    F: Future,
{
    // ---
    tokio::select! {
        biased;
        _ = signal.stopped() => Wake::Stopped,
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(value) => Wake::Ready(value),
            Err(_) => Wake::TimedOut,
        },
    }
}

/// A spawned loop and the signal that stops it.
pub struct Worker {
    // ---
    name: String,
    signal: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    // ---
    /// Spawns `fut` on the tokio runtime under `name`.
    pub fn spawn<F>(name: impl Into<String>, signal: StopSignal, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // ---
        let name = name.into();
        debug!("Starting worker {}", name);

        Self {
            name,
            signal,
            handle: Some(tokio::spawn(fut)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Requests a stop and waits at most `wait` for the task to exit.
    ///
    /// Returns `true` if the task exited in time. On expiry the task is
    /// aborted and a warning is logged.
    pub async fn stop(mut self, wait: Duration) -> bool {
        // ---
        self.signal.stop();

        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(())) => {
                debug!("Worker {} stopped", self.name);
                true
            }
            Ok(Err(e)) => {
                warn!("Worker {} ended abnormally: {}", self.name, e);
                true
            }
            Err(_) => {
                warn!(
                    "Worker {} did not stop within {:?}, abandoning",
                    self.name, wait
                );
                handle.abort();
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // ---
        // The signal may be shared with sibling workers, so only this task
        // is torn down here.
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}
