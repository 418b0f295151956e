use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::FutureExt;
use futures::future::BoxFuture;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::ServeError;
use crate::metrics::instruments;

const TRACING_TARGET: &str = "tower_serve::recover";

type Reporter = Arc<dyn Fn(&ServeError) + Send + Sync>;

/// Turns a panic inside the inner service into [`ServeError::Panicked`].
///
/// Panics raised by `call` itself and panics raised while polling the response
/// future are both caught. Every recovered panic is passed to the reporter before
/// the error is returned. Place this layer outermost: scope guards and tokens held
/// by inner stages are released while the panic unwinds through them.
#[derive(Clone)]
pub struct RecoverLayer {
    reporter: Reporter,
}

impl RecoverLayer {
    pub fn new<F>(reporter: F) -> Self
    where
        F: Fn(&ServeError) + Send + Sync + 'static,
    {
        Self {
            reporter: Arc::new(reporter),
        }
    }
}

impl Default for RecoverLayer {
    /// Recover without reporting beyond the crate's own log event.
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl fmt::Debug for RecoverLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RecoverLayer {
    type Service = RecoverService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoverService {
            inner,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

#[derive(Clone)]
pub struct RecoverService<S> {
    inner: S,
    reporter: Reporter,
}

impl<S: fmt::Debug> fmt::Debug for RecoverService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, Req> Service<Req> for RecoverService<S>
where
    S: Service<Req, Error = BoxError>,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let reporter = Arc::clone(&self.reporter);

        let fut = match catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                let err = recovered(payload, &reporter);
                return Box::pin(futures::future::ready(Err(err)));
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(recovered(payload, &reporter)),
            }
        })
    }
}

fn recovered(payload: Box<dyn Any + Send>, reporter: &Reporter) -> BoxError {
    let err = ServeError::Panicked(panic_message(payload.as_ref()));
    tracing::error!(target: TRACING_TARGET, error = %err, "recovered from panic");
    instruments().recovered_panics.add(1, &[]);
    reporter(&err);
    Box::new(err)
}

/// The message of a panic payload: `&str` and `String` payloads verbatim.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
