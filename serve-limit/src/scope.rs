use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tokio_util::sync::WaitForCancellationFutureOwned;

/// Why a [`Scope`] stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The scope, or one of its ancestors, was cancelled explicitly.
    Cancelled,
    /// The scope's deadline passed.
    DeadlineExceeded,
}

/// A cancellation signal for one unit of work.
///
/// Scopes form a tree: a scope derived with [`Scope::child`] or
/// [`Scope::with_deadline`] is cancelled when its parent is cancelled, when its
/// own deadline passes or when [`Scope::cancel`] is called on it. Cancellation never
/// flows upwards and is irreversible.
///
/// Deadlines are evaluated lazily: no timer runs unless someone waits on
/// [`Scope::cancelled`].
#[derive(Clone, Debug, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    /// Create a root scope. It only stops when cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a scope that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a scope that stops at `deadline` or when `self` stops, whichever
    /// comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a scope that stops `duration` from now or when `self` stops.
    pub fn with_timeout(&self, duration: Duration) -> Self {
        self.with_deadline(Instant::now() + duration)
    }

    /// Derive a scope that does not observe `self` at all.
    ///
    /// The returned scope stops at `deadline` or when cancelled explicitly. Whoever
    /// detaches a scope is responsible for forwarding the parent's cancellation
    /// when (and if) it should apply.
    pub fn detached(&self, deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this scope and every scope derived from it. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the scope has been cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the scope stopped, or `None` while it is still live.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Cancelled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// The instant at which this scope stops on its own, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// A future that resolves once the scope stops.
    ///
    /// The future owns what it needs, so it may outlive `self`.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.token.clone().cancelled_owned(),
            deadline: self.deadline.map(|deadline| Box::pin(sleep_until(deadline))),
        }
    }

    /// Returns a guard that cancels this scope when dropped.
    ///
    /// Holding the guard for the lifetime of a request releases the scope, and
    /// everything derived from it, on every exit path including unwinding.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            inner: self.token.clone().drop_guard(),
        }
    }
}

pin_project! {
    /// Future returned by [`Scope::cancelled`].
    #[must_use = "futures do nothing unless polled"]
    pub struct Cancelled {
        #[pin]
        token: WaitForCancellationFutureOwned,
        deadline: Option<Pin<Box<Sleep>>>,
    }
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.token.poll(cx).is_ready() {
            return Poll::Ready(());
        }
        match this.deadline {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Cancels its [`Scope`] when dropped.
#[derive(Debug)]
pub struct ScopeGuard {
    inner: DropGuard,
}

impl ScopeGuard {
    /// Forget the guard without cancelling the scope.
    pub fn disarm(self) {
        let _ = self.inner.disarm();
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use super::*;

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = Scope::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(grandchild.is_cancelled());

        let sibling = parent.child();
        parent.cancel();
        assert_eq!(sibling.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn cancel_is_idempotent() {
        let scope = Scope::new();
        scope.cancel();
        scope.cancel();
        assert_eq!(scope.reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn deadline_expires_lazily() {
        tokio::time::pause();

        let scope = Scope::new().with_timeout(Duration::from_millis(50));
        assert!(!scope.is_cancelled());
        assert_eq!(scope.remaining(), Some(Duration::from_millis(50)));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(scope.reason(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(scope.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn derived_deadline_never_extends_parent() {
        tokio::time::pause();

        let parent = Scope::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(5));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn detached_scope_ignores_parent() {
        tokio::time::pause();

        let parent = Scope::new().with_timeout(Duration::from_millis(10));
        let detached = parent.detached(Instant::now() + Duration::from_secs(1));
        parent.cancel();

        assert!(!detached.is_cancelled());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(detached.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelled_future_resolves_at_deadline() {
        tokio::time::pause();

        let start = Instant::now();
        let scope = Scope::new().with_timeout(Duration::from_millis(30));
        scope.cancelled().await;
        assert_ge!(start.elapsed(), Duration::from_millis(30));
        assert_le!(start.elapsed(), Duration::from_millis(31));
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_parent_cancel() {
        let parent = Scope::new();
        let child = parent.child();
        let waiting = child.cancelled();

        assert!(futures::poll!(Box::pin(child.cancelled())).is_pending());
        parent.cancel();
        waiting.await;
    }

    #[test]
    fn guard_releases_on_drop_and_disarms() {
        let scope = Scope::new();
        let child = scope.child();

        let guard = child.guard();
        guard.disarm();
        assert!(!child.is_cancelled());

        {
            let _guard = child.guard();
        }
        assert!(child.is_cancelled());
        assert!(!scope.is_cancelled());
    }

    #[test]
    fn guard_releases_while_unwinding() {
        let scope = Scope::new();
        let inner = scope.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.guard();
            if !inner.is_cancelled() {
                panic!("handler failed");
            }
        }));

        assert!(result.is_err());
        assert!(scope.is_cancelled());
    }
}
