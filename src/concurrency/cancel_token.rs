//! Cancellation tokens.
//!
//! Every processor's `process(ctx, in)` takes a [`CancelToken`] in place of
//! Go's `context.Context`. The token can be cloned and shared across tasks;
//! cancelling it (or any ancestor) is observed by every pending
//! [`CancelToken::cancelled`] future, which every `tokio::select!` in this
//! crate races against its other branches.
//!
//! Ported from a workflow engine's `concurrency::cancel_token` module and
//! generalized: cancellation here is the `ctx` of the stream-processing
//! contract rather than a workflow-case-scoped concept.

use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;

/// A token for cooperative task cancellation.
///
/// Cloning shares the same cancellation state. [`CancelToken::child_token`]
/// creates a token that is cancelled whenever its parent is, letting a
/// composed processor (Retry wrapping an inner processor, Router feeding
/// several routes) cancel every dependent task with a single call.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: RwLock<bool>,
    notify: Notify,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Create a new, unparented cancellation token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Create a child token. Cancelling `self` (or any of its own
    /// ancestors) cancels the child; cancelling the child does not
    /// propagate upward.
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: RwLock::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this token. Idempotent.
    pub fn cancel(&self) {
        *self.inner.cancelled.write() = true;
        self.inner.notify.notify_waiters();
    }

    /// `true` if this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancelled.read() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Await cancellation of this token or any ancestor. Resolves
    /// immediately if already cancelled. Meant to be raced inside
    /// `tokio::select!` alongside channel operations and timers.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Race our own notify against the parent's, so a parent-only
        // cancellation still wakes a task that only awaited the child.
        match &self.inner.parent {
            None => {
                let notified = self.inner.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                notified.await;
            }
            Some(parent) => {
                let notified = self.inner.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = notified => {},
                    _ = Box::pin(parent.cancelled()) => {},
                }
            }
        }
    }

    /// An owned future that resolves once this token is cancelled, for
    /// contexts that need `'static` (e.g. `tokio::spawn`).
    pub fn cancelled_owned(self) -> Cancelled {
        Cancelled { token: self }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`CancelToken::cancelled_owned`].
pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        let notified = self.token.inner.notify.notified();
        tokio::pin!(notified);
        notified.poll(cx)
    }
}

/// RAII cancellation scope: cancels its token when dropped, unless
/// [`CancelScope::leak`] was called first.
pub struct CancelScope {
    token: CancelToken,
    cancel_on_drop: bool,
}

impl CancelScope {
    /// Create a new top-level scope.
    pub fn new() -> Self {
        Self {
            token: CancelToken::new(),
            cancel_on_drop: true,
        }
    }

    /// Create a scope whose token is a child of `parent`.
    pub fn with_parent(parent: &CancelToken) -> Self {
        Self {
            token: parent.child_token(),
            cancel_on_drop: true,
        }
    }

    /// The token this scope owns.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Cancel now, without waiting for drop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Detach the token from this scope: it will not be cancelled when
    /// the scope drops. Returns the now-independent token.
    pub fn leak(mut self) -> CancelToken {
        self.cancel_on_drop = false;
        self.token.clone()
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        if self.cancel_on_drop {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn cancel_is_observed() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_inherits_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            parent.cancel();
        });

        timeout(Duration::from_millis(200), child.cancelled())
            .await
            .expect("child should observe parent cancellation");
    }

    #[tokio::test]
    async fn scope_cancels_on_drop() {
        let token = {
            let scope = CancelScope::new();
            scope.token().clone()
        };
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn leaked_scope_does_not_cancel() {
        let token = {
            let scope = CancelScope::new();
            scope.leak()
        };
        assert!(!token.is_cancelled());
    }
}
