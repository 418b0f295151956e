use std::any::Any;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use bytes::Buf;
use bytes::Bytes;
use http::Request;
use http_body::Body;
use http_body::Frame;
use http_body::SizeHint;
use http_body_util::combinators::UnsyncBoxBody;
use pin_project_lite::pin_project;
use tower::BoxError;

use crate::metrics::instruments;

const TRACING_TARGET: &str = "tower_serve::body";

/// The body a [`BodyLimiter`] was installed on, with its data as [`Bytes`].
pub type OriginalBody = UnsyncBoxBody<Bytes, BoxError>;

/// Returned when a body is read beyond its ceiling.
///
/// Detect it with `err.is::<BodyLimitExceeded>()` or, when it may be wrapped by a
/// framework error, with [`is_body_limit_exceeded`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("body limit exceeded")]
pub struct BodyLimitExceeded;

/// Returns true if `err`, or any error in its source chain, is [`BodyLimitExceeded`].
pub fn is_body_limit_exceeded(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<BodyLimitExceeded>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// A request body with a replaceable byte ceiling.
///
/// The limiter keeps the original body it wraps. Installing a limit on a body
/// that already has one, or calling [`BodyLimiter::relimit`], rewraps that
/// original body, so ceilings never stack: the most recent one wins.
///
/// Bytes of a frame that crossed the ceiling are held back rather than
/// discarded, and are the first bytes served after a wider ceiling is set.
pub struct BodyLimiter {
    original: OriginalBody,
    pending: Option<Bytes>,
    ceiling: u64,
    consumed: u64,
    exceeded: bool,
}

impl BodyLimiter {
    /// Limit `body` to `ceiling` bytes. If `body` is already a `BodyLimiter`
    /// its ceiling is replaced instead.
    pub fn new<B>(body: B, ceiling: u64) -> Self
    where
        B: Body + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut slot = Some(body);
        let limited = (&mut slot as &mut dyn Any)
            .downcast_mut::<Option<BodyLimiter>>()
            .and_then(Option::take);
        if let Some(mut limiter) = limited {
            limiter.relimit(ceiling);
            return limiter;
        }

        let original = slot
            .map(|inner| UnsyncBoxBody::new(IntoBytes { inner }))
            .unwrap_or_default();
        Self {
            original,
            pending: None,
            ceiling,
            consumed: 0,
            exceeded: false,
        }
    }

    /// Replace the ceiling. Counting restarts from the original body's current
    /// position and a previous violation is forgotten.
    pub fn relimit(&mut self, ceiling: u64) {
        self.ceiling = ceiling;
        self.consumed = 0;
        self.exceeded = false;
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// The original, unwrapped body. Bytes held back after crossing the
    /// ceiling are not part of it.
    pub fn get_ref(&self) -> &OriginalBody {
        &self.original
    }

    pub fn into_original(self) -> OriginalBody {
        self.original
    }

    fn exceed(&mut self) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if !self.exceeded {
            self.exceeded = true;
            record_exceeded(self.ceiling);
        }
        Poll::Ready(Some(Err(Box::new(BodyLimitExceeded))))
    }

    fn admit(&mut self, mut data: Bytes) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let remaining = self.ceiling.saturating_sub(self.consumed);
        let len = data.len() as u64;
        if len <= remaining {
            self.consumed += len;
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }

        // Hand out what still fits; the rest waits for a wider ceiling.
        let head = data.split_to(remaining as usize);
        self.pending = Some(data);
        if head.is_empty() {
            return self.exceed();
        }
        self.consumed = self.ceiling;
        self.exceeded = true;
        record_exceeded(self.ceiling);
        Poll::Ready(Some(Ok(Frame::data(head))))
    }
}

impl fmt::Debug for BodyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyLimiter")
            .field("ceiling", &self.ceiling)
            .field("consumed", &self.consumed)
            .field("pending", &self.pending.as_ref().map(Bytes::len))
            .field("exceeded", &self.exceeded)
            .finish_non_exhaustive()
    }
}

impl Body for BodyLimiter {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.exceeded {
            return this.exceed();
        }
        if let Some(pending) = this.pending.take() {
            return this.admit(pending);
        }

        let remaining = this.ceiling.saturating_sub(this.consumed);
        if this.original.size_hint().lower() > remaining {
            return this.exceed();
        }

        let frame = match ready!(Pin::new(&mut this.original).poll_frame(cx)) {
            None => return Poll::Ready(None),
            Some(Err(err)) => return Poll::Ready(Some(Err(err))),
            Some(Ok(frame)) => frame,
        };
        match frame.into_data() {
            Ok(data) => this.admit(data),
            Err(frame) => Poll::Ready(Some(Ok(frame))),
        }
    }

    fn is_end_stream(&self) -> bool {
        !self.exceeded && self.pending.is_none() && self.original.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let held = self.pending.as_ref().map_or(0, |data| data.len() as u64);
        let inner = self.original.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower().saturating_add(held));
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper.saturating_add(held));
        }
        hint
    }
}

pin_project! {
    /// Presents any body as `Bytes` frames with boxed errors, keeping its size hint.
    struct IntoBytes<B> {
        #[pin]
        inner: B,
    }
}

impl<B> Body for IntoBytes<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let frame = ready!(self.project().inner.poll_frame(cx));
        Poll::Ready(frame.map(|frame| {
            frame
                .map(|frame| frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))
                .map_err(Into::into)
        }))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn record_exceeded(ceiling: u64) {
    tracing::warn!(target: TRACING_TARGET, ceiling, "request body exceeded its limit");
    instruments().body_limit_exceeded.add(1, &[]);
}

/// Wrap the body of `req` in a [`BodyLimiter`] with the given ceiling.
///
/// A body that is already limited keeps its single limiter, which is
/// rewrapped around the original body with the new ceiling.
pub fn install_limit<B>(req: Request<B>, ceiling: u64) -> Request<BodyLimiter>
where
    B: Body + Send + 'static,
    B::Error: Into<BoxError>,
{
    req.map(|body| BodyLimiter::new(body, ceiling))
}

/// Replace the ceiling of a body that already has a limiter, e.g. to raise a
/// default limit for a route that accepts uploads.
pub fn limit_body(req: &mut Request<BodyLimiter>, ceiling: u64) {
    req.body_mut().relimit(ceiling);
}
