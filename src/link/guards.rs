//! RAII guards for spawned tasks and subscriptions
//!
//! Every periodic callback in the crate is a tokio task. These guards tie the
//! task's lifetime to its owner: when a guard is dropped the task is aborted,
//! so no callback can fire after the owning component shut down.

use tokio::task::JoinHandle;
use tracing::debug;

/// Aborts the wrapped task when dropped
pub struct AbortOnDrop {
    handle: Option<JoinHandle<()>>,
    name: &'static str,
}

impl AbortOnDrop {
    pub fn new(handle: JoinHandle<()>, name: &'static str) -> Self {
        Self { handle: Some(handle), name }
    }

    /// True while the task has not completed or been aborted
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Abort now instead of waiting for drop. Safe to call repeatedly.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "Task aborted");
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Callback subscription handle
///
/// Returned by `ConnectionRegistry::on_state_change` / `on_message`. The
/// forwarding task stops as soon as the handle is dropped or cancelled, so a
/// consumer that stops listening never leaves a listener behind.
pub struct Subscription {
    task: AbortOnDrop,
}

impl Subscription {
    pub(crate) fn new(handle: JoinHandle<()>, name: &'static str) -> Self {
        Self { task: AbortOnDrop::new(handle, name) }
    }

    pub fn is_active(&self) -> bool {
        self.task.is_active()
    }

    pub fn cancel(mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_task() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let guard = AbortOnDrop::new(
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
            }),
            "test",
        );
        assert!(guard.is_active());
        drop(guard);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let mut guard = AbortOnDrop::new(tokio::spawn(std::future::pending()), "pending");
        guard.abort();
        guard.abort();
        assert!(!guard.is_active());
    }
}
