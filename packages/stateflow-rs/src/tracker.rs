//! Tracking for detached asynchronous continuations.
//!
//! The drain loop never awaits asynchronous effects. Each detached
//! continuation holds a [`ContinuationGuard`] for as long as it runs, and
//! callers that need to know when the dispatcher has gone quiet await
//! [`AsyncTracker::wait_idle`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::StateflowError;

/// Counts running continuations and keeps the first failure they report.
#[derive(Default)]
pub(crate) struct AsyncTracker {
    /// Continuations spawned but not yet finished
    running: AtomicUsize,
    /// Wakes waiters when `running` hits zero
    notify: Notify,
    /// First failure since the last successful wait
    first_error: Mutex<Option<StateflowError>>,
}

impl AsyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a continuation as running until the guard drops.
    pub fn start(self: &Arc<Self>) -> ContinuationGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        ContinuationGuard {
            tracker: self.clone(),
        }
    }

    fn finish(&self) {
        let prev = self.running.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Record a failure. Only the first one is kept.
    pub fn record_error(&self, err: StateflowError) {
        let mut guard = match self.first_error.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("async tracker mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    /// Number of continuations still running.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Wait until no continuation is running.
    ///
    /// Returns the first failure recorded since the previous wait, and clears
    /// it.
    pub async fn wait_idle(&self) -> Result<(), StateflowError> {
        loop {
            // Register for notification BEFORE checking the count, otherwise
            // a continuation finishing in between would be missed.
            let notified = self.notify.notified();

            if self.running.load(Ordering::Acquire) == 0 {
                let err = self
                    .first_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                return match err {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }

            notified.await;
            // Notify is edge-triggered, recheck
        }
    }
}

impl std::fmt::Debug for AsyncTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTracker")
            .field("running", &self.running())
            .finish()
    }
}

/// RAII guard for one detached continuation.
///
/// Dropping it marks the continuation finished, including when the task
/// panics or is aborted.
pub(crate) struct ContinuationGuard {
    tracker: Arc<AsyncTracker>,
}

impl ContinuationGuard {
    pub fn fail(&self, err: StateflowError) {
        self.tracker.record_error(err);
    }
}

impl Drop for ContinuationGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_nothing_runs() {
        let tracker = Arc::new(AsyncTracker::new());
        tracker.wait_idle().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_guard() {
        let tracker = Arc::new(AsyncTracker::new());
        let guard = tracker.start();
        assert_eq!(tracker.running(), 1);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
        assert_eq!(tracker.running(), 0);
    }

    #[tokio::test]
    async fn test_first_error_is_kept_and_cleared() {
        let tracker = Arc::new(AsyncTracker::new());
        {
            let guard = tracker.start();
            guard.fail(StateflowError::NoAsyncRuntime { action_type: "First" });
            guard.fail(StateflowError::NoAsyncRuntime { action_type: "Second" });
        }

        let err = tracker.wait_idle().await.unwrap_err();
        assert!(matches!(
            err,
            StateflowError::NoAsyncRuntime { action_type: "First" }
        ));

        tracker.wait_idle().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_guards_across_tasks() {
        let tracker = Arc::new(AsyncTracker::new());
        let mut handles = Vec::new();
        for i in 0..50u64 {
            let guard = tracker.start();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i % 5)).await;
                drop(guard);
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), tracker.wait_idle())
            .await
            .expect("tracker never went idle")
            .unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
