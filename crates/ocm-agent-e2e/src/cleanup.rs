//! Scoped acquisition with guaranteed release.
//!
//! Resources owned by a run (the port-forward process, records created in OCM)
//! register their release action on a [`CleanupScope`] the moment they are
//! acquired. [`CleanupScope::guard`] runs the body and then every registered
//! action in reverse order, exactly once, whether the body finished, returned a
//! fatal step, or panicked.
//!
//! Cleanup failures are logged and swallowed so they never mask the outcome of
//! the run itself.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

struct CleanupAction {
    label: String,
    action: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

/// Registry of release actions for one run.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct CleanupScope {
    actions: Arc<Mutex<Vec<CleanupAction>>>,
}

impl std::fmt::Debug for CleanupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScope")
            .field("pending", &self.labels())
            .finish()
    }
}

impl CleanupScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action. Call this immediately after acquiring the
    /// resource it releases.
    pub fn defer<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        debug!(target: "ocm_e2e.cleanup", cleanup = %label, "Registered cleanup");
        self.lock().push(CleanupAction {
            label,
            action: Box::new(move || action().boxed()),
        });
    }

    /// Labels of the actions still pending, in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.lock().iter().map(|a| a.label.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `body`, then release everything registered so far.
    ///
    /// A panic inside `body` is re-raised after the cleanups have run.
    pub async fn guard<Fut, T>(&self, body: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        self.run_all().await;

        match outcome {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Run all pending actions in reverse registration order.
    ///
    /// Actions are drained before they run, so each executes at most once even
    /// if this is called again.
    pub async fn run_all(&self) {
        let actions: Vec<CleanupAction> = self.lock().drain(..).rev().collect();

        for CleanupAction { label, action } in actions {
            debug!(target: "ocm_e2e.cleanup", cleanup = %label, "Running cleanup");
            if AssertUnwindSafe(action()).catch_unwind().await.is_err() {
                warn!(
                    target: "ocm_e2e.cleanup",
                    cleanup = %label,
                    "Cleanup panicked, continuing with remaining cleanups"
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CleanupAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        // Only the last handle reports leaked actions.
        if Arc::strong_count(&self.actions) == 1 && !self.is_empty() {
            warn!(
                target: "ocm_e2e.cleanup",
                pending = ?self.labels(),
                "CleanupScope dropped with cleanups that never ran"
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(scope: &CleanupScope, label: &str, counter: &Arc<AtomicUsize>) {
        let counter = counter.clone();
        scope.defer(label, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    #[tokio::test]
    async fn test_guard_runs_cleanup_after_body() {
        let scope = CleanupScope::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let value = scope
            .guard(async {
                counting(&scope, "record", &counter);
                assert_eq!(counter.load(Ordering::SeqCst), 0);
                42
            })
            .await;

        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn test_cleanups_run_in_reverse_order() {
        let scope = CleanupScope::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["port-forward", "record"] {
            let order = order.clone();
            scope.defer(label, move || async move {
                order.lock().unwrap().push(label);
            });
        }
        scope.run_all().await;

        assert_eq!(*order.lock().unwrap(), vec!["record", "port-forward"]);
    }

    #[tokio::test]
    async fn test_cleanup_runs_exactly_once() {
        let scope = CleanupScope::new();
        let counter = Arc::new(AtomicUsize::new(0));
        counting(&scope, "record", &counter);

        scope.guard(async {}).await;
        scope.run_all().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_body_panics() {
        let scope = CleanupScope::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner = scope.clone();
        let counter_clone = counter.clone();
        let result = tokio::spawn(async move {
            inner
                .guard(async {
                    counting(&inner, "port-forward", &counter_clone);
                    panic!("assertion inside the run");
                })
                .await
        })
        .await;

        assert!(result.is_err(), "panic should propagate");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_does_not_stop_others() {
        let scope = CleanupScope::new();
        let counter = Arc::new(AtomicUsize::new(0));

        counting(&scope, "first", &counter);
        scope.defer("broken", || async { panic!("cleanup failed") });

        scope.run_all().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_lists_pending_labels() {
        let scope = CleanupScope::new();
        scope.defer("port-forward", || async {});

        let debug = format!("{scope:?}");
        assert!(debug.contains("port-forward"));
        assert_eq!(scope.labels(), vec!["port-forward"]);
    }
}
