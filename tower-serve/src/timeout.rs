use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use http::Request;
use tower::Layer;
use tower::Service;

use crate::scope::ScopedFuture;
use crate::scope::request_scope;
use crate::scope::set_request_scope;

const TRACING_TARGET: &str = "tower_serve::timeout";

/// Bounds how long a request may run.
///
/// Every request gets a scope derived from its current one that stops `duration`
/// after the request arrives, or earlier if the current scope stops. The layer
/// never writes a response on expiry: the inner service observes its scope via
/// [`request_scope`](crate::request_scope) and decides what to answer.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutLayer {
    duration: Duration,
}

impl TimeoutLayer {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            duration: self.duration,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeoutService<S> {
    inner: S,
    duration: Duration,
}

impl<S, B> Service<Request<B>> for TimeoutService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ScopedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let scope = request_scope(&req).with_timeout(self.duration);
        tracing::debug!(target: TRACING_TARGET, timeout = ?self.duration, "derived request scope");

        let guard = scope.guard();
        set_request_scope(&mut req, scope);
        ScopedFuture::new(self.inner.call(req), guard)
    }
}
