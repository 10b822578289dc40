//! Progress reporting and cooperative cancellation
//!
//! Every fetch accepts a `Progress` handle. Stores seed the total when it is
//! still unknown (negative) and advance the completed count as chunks are
//! delivered. Cancellation is cooperative: producers check `is_cancelled`
//! between chunks, and transports can race an await against `cancelled()`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable progress handle shared between the caller and the pipeline.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    /// Total unit count; negative means not yet known
    total: AtomicI64,
    completed: AtomicI64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                total: AtomicI64::new(-1),
                completed: AtomicI64::new(0),
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn total(&self) -> i64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: i64) {
        self.inner.total.store(total, Ordering::Relaxed);
    }

    pub fn completed(&self) -> i64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn set_completed(&self, completed: i64) {
        self.inner.completed.store(completed, Ordering::Relaxed);
    }

    pub fn add_completed(&self, units: u64) {
        self.inner
            .completed
            .fetch_add(units as i64, Ordering::Relaxed);
    }

    /// Request cancellation. Producers observe it at their next checkpoint
    /// and finish with `on_aborted(None)`.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` has been called. Intended for racing against
    /// transport awaits via `tokio::select!`.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking the flag so a cancel
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("total", &self.total())
            .field("completed", &self.completed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_starts_unknown() {
        let progress = Progress::new();
        assert!(progress.total() < 0);
        assert_eq!(progress.completed(), 0);
        assert!(!progress.is_cancelled());
    }

    #[test]
    fn test_counters_update() {
        let progress = Progress::new();
        progress.set_total(100);
        progress.add_completed(30);
        progress.add_completed(20);
        assert_eq!(progress.total(), 100);
        assert_eq!(progress.completed(), 50);
    }

    #[test]
    fn test_clones_share_state() {
        let progress = Progress::new();
        let clone = progress.clone();
        clone.cancel();
        assert!(progress.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_after_cancel() {
        let progress = Progress::new();
        let waiter = progress.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        progress.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_immediately_when_already_cancelled() {
        let progress = Progress::new();
        progress.cancel();
        progress.cancelled().await;
    }
}
