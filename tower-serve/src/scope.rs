use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use http::Request;
use pin_project_lite::pin_project;
use serve_limit::Scope;
use serve_limit::ScopeGuard;
use tower::Layer;
use tower::Service;

/// The cancellation scope attached to `req`, or a fresh root scope if none is.
pub fn request_scope<B>(req: &Request<B>) -> Scope {
    req.extensions().get::<Scope>().cloned().unwrap_or_default()
}

/// Replace the scope downstream stages will see.
pub(crate) fn set_request_scope<B>(req: &mut Request<B>, scope: Scope) {
    req.extensions_mut().insert(scope);
}

pin_project! {
    /// Drives the inner future and releases a derived scope when it completes or is
    /// dropped.
    pub struct ScopedFuture<F> {
        #[pin]
        inner: F,
        guard: Option<ScopeGuard>,
    }
}

impl<F> ScopedFuture<F> {
    pub(crate) fn new(inner: F, guard: ScopeGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<F: Future> Future for ScopedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = std::task::ready!(this.inner.poll(cx));
        this.guard.take();
        Poll::Ready(output)
    }
}

/// Attaches a child of `parent` to every request.
///
/// Use this at the edge of a stack to tie requests to a longer lived scope, such
/// as one cancelled on server shutdown. The child is cancelled as soon as the
/// request completes or its future is dropped.
#[derive(Clone, Debug, Default)]
pub struct ScopeLayer {
    parent: Scope,
}

impl ScopeLayer {
    pub fn new(parent: Scope) -> Self {
        Self { parent }
    }
}

impl<S> Layer<S> for ScopeLayer {
    type Service = ScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ScopeService {
            inner,
            parent: self.parent.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScopeService<S> {
    inner: S,
    parent: Scope,
}

impl<S, B> Service<Request<B>> for ScopeService<S>
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
        let scope = self.parent.child();
        let guard = scope.guard();
        set_request_scope(&mut req, scope);
        ScopedFuture::new(self.inner.call(req), guard)
    }
}
