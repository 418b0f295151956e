use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::Either;
use futures::future::Ready;
use futures::future::ready;
use http::Extensions;
use http::HeaderMap;
use http::HeaderName;
use http::Request;
use serve_limit::Gcra;
use serve_limit::Keyed;
use serve_limit::Reason;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::ServeError;
use crate::addr::ip;
use crate::metrics::instruments;

const TRACING_TARGET: &str = "tower_serve::protect";

type KeyFn = Arc<dyn Fn(&HeaderMap, &Extensions) -> Option<String> + Send + Sync>;

/// The client IP of a request, taken from the peer address in its extensions.
///
/// Servers built on hyper insert the peer `SocketAddr` themselves; with the
/// `axum` feature, `ConnectInfo<SocketAddr>` is recognised too.
pub fn peer_ip(_headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    if let Some(addr) = extensions.get::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    #[cfg(feature = "axum")]
    if let Some(axum::extract::ConnectInfo(addr)) =
        extensions.get::<axum::extract::ConnectInfo<SocketAddr>>()
    {
        return Some(addr.ip().to_string());
    }
    None
}

/// Limits how fast each client may send requests.
///
/// Every client key gets its own [`Gcra`] admitting `rate` requests per `period`.
/// A refused request fails with [`ServeError::RateLimited`] without reaching the
/// inner service. Requests for which no key can be extracted pass through.
///
/// This layer is independent of [`ThrottleLayer`](crate::ThrottleLayer): it bounds
/// arrival rate per client, the throttle bounds work in progress overall.
#[derive(Clone)]
pub struct ProtectLayer {
    limiter: Arc<Keyed<Gcra>>,
    key: KeyFn,
}

impl ProtectLayer {
    pub fn new(rate: NonZeroUsize, period: Duration) -> Self {
        Self::from_keyed(Keyed::new(move || Gcra::new(rate, period)))
    }

    /// Protect with a caller supplied per-key strategy map, e.g. one with a smaller
    /// key capacity.
    pub fn from_keyed(limiter: Keyed<Gcra>) -> Self {
        Self {
            limiter: Arc::new(limiter),
            key: Arc::new(peer_ip),
        }
    }

    /// Replace how the client key is extracted.
    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&HeaderMap, &Extensions) -> Option<String> + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    /// Key clients by the first address listed in `header`, as set by a trusted
    /// proxy (for instance `x-forwarded-for`). Ports are stripped.
    pub fn with_header_key(self, header: HeaderName) -> Self {
        self.with_key(move |headers, _| {
            let value = headers.get(&header)?.to_str().ok()?;
            let first = value.split(',').next()?.trim();
            if first.is_empty() {
                return None;
            }
            Some(ip(first).map_or_else(|| first.to_owned(), |ip| ip.to_string()))
        })
    }

    /// The per-key strategies shared by every service built from this layer.
    pub fn limiter(&self) -> &Keyed<Gcra> {
        &self.limiter
    }
}

impl fmt::Debug for ProtectLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectLayer")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ProtectLayer {
    type Service = ProtectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProtectService {
            inner,
            limiter: Arc::clone(&self.limiter),
            key: Arc::clone(&self.key),
        }
    }
}

#[derive(Clone)]
pub struct ProtectService<S> {
    inner: S,
    limiter: Arc<Keyed<Gcra>>,
    key: KeyFn,
}

impl<S: fmt::Debug> fmt::Debug for ProtectService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, B> Service<Request<B>> for ProtectService<S>
where
    S: Service<Request<B>, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Either<Ready<Result<S::Response, BoxError>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let Some(key) = (self.key)(req.headers(), req.extensions()) else {
            return Either::Right(self.inner.call(req));
        };

        match self.limiter.process(&key) {
            ControlFlow::Continue(()) => Either::Right(self.inner.call(req)),
            ControlFlow::Break(Reason::Overloaded { retry_after }) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    client = %key,
                    ?retry_after,
                    "request rate exceeded"
                );
                instruments().protect_rejected.add(1, &[]);
                Either::Left(ready(Err(
                    Box::new(ServeError::RateLimited { retry_after }) as BoxError
                )))
            }
        }
    }
}
