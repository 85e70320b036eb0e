//! Cooperative cancellation for a run's worker pool.
//!
//! Adapted from a hierarchical cancel-token design: a token can be cloned
//! and shared across workers, and cancelling a parent cancels every child
//! it ever produced. `Engine::run` hands each invocation one root token;
//! the worker pool hands each in-flight node a child so that per-node
//! timeouts never have to reach back into the parent's state.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

/// A token for cooperative task cancellation.
///
/// Cloning shares the same underlying state. Cancelling any clone (or any
/// parent in its chain) is visible to every clone immediately.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: RwLock<bool>,
    notify: Notify,
    children: RwLock<Vec<CancelToken>>,
}

impl CancelToken {
    /// Create a fresh, unlinked root token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Derive a child token. Cancelling `self` cancels the child; the
    /// reverse is not true.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.write().push(child.clone());
        }
        child
    }

    /// Cancel this token and every child derived from it.
    pub fn cancel(&self) {
        *self.inner.cancelled.write() = true;
        self.inner.notify.notify_waiters();
        for child in self.inner.children.write().drain(..) {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.read()
    }

    /// Resolves once this token is cancelled. Safe to poll from multiple
    /// workers: each caller gets its own future over the shared `Notify`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_cancelled_with_parent() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        child.cancelled().await;
    }

    #[tokio::test]
    async fn late_child_of_cancelled_parent_is_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        let child = parent.child_token();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn independent_tokens_do_not_affect_each_other() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
