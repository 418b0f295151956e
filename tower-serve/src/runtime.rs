//! Minimum and maximum request runtime.
//!
//! A [`RuntimeLayer`] guarantees the inner service a minimum window in which the
//! caller's cancellation cannot reach it, while a maximum deadline is always
//! enforced. With a zero minimum it is equivalent to a
//! [`TimeoutLayer`](crate::TimeoutLayer) of the maximum.
//!
//! Deferring the caller's cancellation needs a watcher. It lives inside the
//! response future rather than in a spawned task, so it can never outlive the
//! request: when the inner future finishes the child scope is cancelled and the
//! watcher is driven to [`WatchState::Done`] before the response is returned; when
//! the response future is dropped, the watcher is dropped with it.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use http::Request;
use pin_project_lite::pin_project;
use serve_limit::Cancelled;
use serve_limit::Scope;
use serve_limit::ScopeGuard;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::Layer;
use tower::Service;

use crate::ConfigError;
use crate::metrics::instruments;
use crate::scope::request_scope;
use crate::scope::set_request_scope;

const TRACING_TARGET: &str = "tower_serve::runtime";

/// Ensures a minimum and a maximum runtime for every request.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeLayer {
    min: Duration,
    max: Duration,
}

impl RuntimeLayer {
    /// # Errors
    ///
    /// Returns [`ConfigError::MinExceedsMax`] if `min > max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::MinExceedsMax { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl<S> Layer<S> for RuntimeLayer {
    type Service = RuntimeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RuntimeService {
            inner,
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeService<S> {
    inner: S,
    min: Duration,
    max: Duration,
}

impl<S, B> Service<Request<B>> for RuntimeService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = RuntimeFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let parent = request_scope(&req);

        if self.min.is_zero() {
            let scope = parent.with_timeout(self.max);
            let guard = scope.guard();
            set_request_scope(&mut req, scope);
            return RuntimeFuture::new(self.inner.call(req), guard, None);
        }

        let scope = parent.detached(Instant::now() + self.max);
        let guard = scope.guard();
        let watcher = Watcher::new(parent, scope.clone(), self.min);
        tracing::debug!(
            target: TRACING_TARGET,
            min = ?self.min,
            max = ?self.max,
            "derived request scope with deferred cancellation"
        );

        set_request_scope(&mut req, scope);
        RuntimeFuture::new(self.inner.call(req), guard, Some(watcher))
    }
}

pin_project! {
    /// Response future of [`RuntimeService`].
    pub struct RuntimeFuture<F> {
        #[pin]
        inner: F,
        guard: Option<ScopeGuard>,
        watcher: Option<Watcher>,
    }
}

impl<F> RuntimeFuture<F> {
    fn new(inner: F, guard: ScopeGuard, watcher: Option<Watcher>) -> Self {
        Self {
            inner,
            guard: Some(guard),
            watcher,
        }
    }
}

impl<F: Future> Future for RuntimeFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // Poll the watcher first so a forwarded cancellation is visible to the
        // inner future in the same poll.
        if let Some(watcher) = this.watcher.as_mut() {
            let _ = Pin::new(watcher).poll(cx);
        }

        let output = ready!(this.inner.poll(cx));

        // Release the scope, then join the watcher: a cancelled child scope moves
        // it to `Done` on its next poll.
        this.guard.take();
        if let Some(mut watcher) = this.watcher.take() {
            let joined = Pin::new(&mut watcher).poll(cx);
            debug_assert!(joined.is_ready(), "runtime watcher outlived its request");
        }

        Poll::Ready(output)
    }
}

/// States of the runtime [`Watcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    /// The minimum runtime has not elapsed yet; the caller's scope is ignored.
    WaitingMin,
    /// Forwarding the caller's cancellation, if it happens before the maximum.
    WatchingMaxAndParent,
    /// The child scope stopped, through any path.
    Done,
}

enum Waiting {
    Min(Pin<Box<Sleep>>),
    Parent(Pin<Box<Cancelled>>),
    Done,
}

/// Forwards the caller's cancellation into the child scope once the minimum
/// runtime has elapsed.
///
/// The child scope carries the maximum deadline itself, so "the maximum was
/// reached" and "the child was cancelled" are the same event for the watcher.
pub(crate) struct Watcher {
    parent: Scope,
    child: Scope,
    child_stopped: Pin<Box<Cancelled>>,
    waiting: Waiting,
}

impl Watcher {
    fn new(parent: Scope, child: Scope, min: Duration) -> Self {
        Self {
            child_stopped: Box::pin(child.cancelled()),
            parent,
            child,
            waiting: Waiting::Min(Box::pin(sleep(min))),
        }
    }

    pub(crate) fn state(&self) -> WatchState {
        match self.waiting {
            Waiting::Min(_) => WatchState::WaitingMin,
            Waiting::Parent(_) => WatchState::WatchingMaxAndParent,
            Waiting::Done => WatchState::Done,
        }
    }
}

impl Future for Watcher {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        loop {
            if matches!(this.waiting, Waiting::Done) {
                return Poll::Ready(());
            }
            if this.child_stopped.as_mut().poll(cx).is_ready() {
                this.waiting = Waiting::Done;
                return Poll::Ready(());
            }

            let next = match &mut this.waiting {
                Waiting::Min(min) => {
                    ready!(min.as_mut().poll(cx));
                    tracing::debug!(target: TRACING_TARGET, "minimum runtime elapsed");
                    Waiting::Parent(Box::pin(this.parent.cancelled()))
                }
                Waiting::Parent(parent) => {
                    ready!(parent.as_mut().poll(cx));
                    tracing::debug!(
                        target: TRACING_TARGET,
                        "forwarding caller cancellation after minimum runtime"
                    );
                    instruments().runtime_deferred_cancel.add(1, &[]);
                    this.child.cancel();
                    Waiting::Done
                }
                Waiting::Done => Waiting::Done,
            };
            this.waiting = next;
            tracing::trace!(
                target: TRACING_TARGET,
                state = ?this.state(),
                "runtime watcher advanced"
            );
        }
    }
}
