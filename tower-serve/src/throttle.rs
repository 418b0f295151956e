use std::num::NonZeroUsize;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use http::Request;
use serve_limit::TokenPool;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::ServeError;
use crate::metrics::instruments;
use crate::scope::request_scope;

const TRACING_TARGET: &str = "tower_serve::throttle";

/// Limits how many requests are active at once.
///
/// Requests beyond the limit wait for a token. A waiting request is rejected with
/// [`ServeError::TooManyRequests`] only when its own scope stops first, so combine
/// this layer with a [`TimeoutLayer`](crate::TimeoutLayer) or
/// [`RuntimeLayer`](crate::RuntimeLayer) placed outside it to bound the wait.
///
/// Clones of the layer, and every service it produces, share one token pool.
#[derive(Clone, Debug)]
pub struct ThrottleLayer {
    pool: TokenPool,
}

impl ThrottleLayer {
    pub fn new(concurrency: NonZeroUsize) -> Self {
        Self {
            pool: TokenPool::new(concurrency),
        }
    }

    /// The pool shared by every service built from this layer.
    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThrottleService<S> {
    inner: S,
    pool: TokenPool,
}

impl<S, B> Service<Request<B>> for ThrottleService<S>
where
    S: Service<Request<B>, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let pool = self.pool.clone();

        Box::pin(async move {
            let scope = request_scope(&req);
            let _token = match pool.acquire(&scope).await {
                Ok(token) => token,
                Err(_) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        concurrency = pool.capacity(),
                        "request cancelled while waiting for a token"
                    );
                    instruments().throttle_rejected.add(1, &[]);
                    return Err(Box::new(ServeError::TooManyRequests) as BoxError);
                }
            };

            inner.call(req).await
        })
    }
}
