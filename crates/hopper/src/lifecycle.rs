//! Cooperative two-phase shutdown
//!
//! Every active component in the pipeline follows the same lifecycle:
//! `signal_stop` flips a cooperative flag (idempotent, non-blocking) and
//! `wait_for_stop` blocks until the component's loop has observed the
//! flag and all of its dispatched work has drained, up to a bounded
//! timeout. [`Stoppable`] implements that pair once; components compose
//! it instead of rolling their own.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct Stoppable {
    name: &'static str,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Stoppable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token observed by component loops; cancelled when stop is signalled.
    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a unit of work tracked for drain at shutdown.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Signal the component to stop. Idempotent and non-blocking.
    pub fn signal_stop(&self) {
        if !self.token.is_cancelled() {
            info!(component = self.name, "Stop requested");
            self.token.cancel();
        }
    }

    /// Wait until all tracked work has finished, or the timeout elapses.
    ///
    /// Returns true when the component drained cleanly.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!(component = self.name, "Stopped cleanly");
                true
            },
            Err(_) => {
                warn!(
                    component = self.name,
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout elapsed with work still in flight"
                );
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let stoppable = Stoppable::new("test");
        assert!(!stoppable.is_stopping());
        stoppable.signal_stop();
        stoppable.signal_stop();
        assert!(stoppable.is_stopping());
    }

    #[tokio::test]
    async fn test_wait_drains_spawned_work() {
        let stoppable = Stoppable::new("test");
        let token = stoppable.stop_token();
        stoppable.spawn(async move {
            token.cancelled().await;
        });

        stoppable.signal_stop();
        assert!(stoppable.wait_for_stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_work() {
        let stoppable = Stoppable::new("test");
        stoppable.spawn(async {
            std::future::pending::<()>().await;
        });

        stoppable.signal_stop();
        assert!(!stoppable.wait_for_stop(Duration::from_millis(50)).await);
    }
}
