use std::task::Context;
use std::task::Poll;

use http::Request;
use http_body::Body;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::body::BodyLimiter;

const TRACING_TARGET: &str = "tower_serve::limit";

/// Installs a [`BodyLimiter`] on every request body.
///
/// Reading past the ceiling fails with [`BodyLimitExceeded`](crate::BodyLimitExceeded).
/// A later stage or the handler may replace the ceiling with
/// [`limit_body`](crate::limit_body). A body that is already limited is not
/// wrapped again: the innermost `LimitLayer` sets the ceiling that applies.
#[derive(Clone, Copy, Debug)]
pub struct LimitLayer {
    ceiling: u64,
}

impl LimitLayer {
    /// Accepts a byte count or a [`ByteSize`](crate::ByteSize).
    pub fn new(ceiling: impl Into<u64>) -> Self {
        Self {
            ceiling: ceiling.into(),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}

impl<S> Layer<S> for LimitLayer {
    type Service = LimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LimitService {
            inner,
            ceiling: self.ceiling,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LimitService<S> {
    inner: S,
    ceiling: u64,
}

impl<S, B> Service<Request<B>> for LimitService<S>
where
    S: Service<Request<BodyLimiter>>,
    B: Body + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        tracing::trace!(target: TRACING_TARGET, ceiling = self.ceiling, "limiting request body");
        self.inner.call(crate::install_limit(req, self.ceiling))
    }
}
