use tower::BoxError;

use crate::body::is_body_limit_exceeded;

/// Outcomes produced by the lifecycle middleware stack.
///
/// Services in this crate fail with a boxed `ServeError` so callers can
/// `downcast_ref::<ServeError>()` the `BoxError` they receive.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServeError {
    /// No concurrency token became available before the request's scope stopped.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("Too many concurrent requests; no capacity before the request was cancelled")]
    TooManyRequests,

    /// The client exceeded its request rate.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: std::time::Duration,
    },

    /// The request body was read beyond its ceiling.
    ///
    /// When the `axum` feature is enabled, this converts to `413 Payload Too Large`.
    #[error("Request body exceeded the configured limit")]
    PayloadTooLarge,

    /// The inner service panicked and the panic was recovered.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl ServeError {
    /// Normalise any error coming out of a stack into the `ServeError` domain.
    ///
    /// A body limit violation anywhere in the source chain becomes
    /// [`ServeError::PayloadTooLarge`].
    pub fn from_box(err: BoxError) -> Self {
        match err.downcast::<ServeError>() {
            Ok(err) => *err,
            Err(err) if is_body_limit_exceeded(err.as_ref()) => Self::PayloadTooLarge,
            Err(err) => Self::Inner(err.to_string()),
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServeError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, headers) = match self {
            Self::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, self.to_string(), None),
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let val = axum::http::HeaderValue::from(secs);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    self.to_string(),
                    Some((axum::http::header::RETRY_AFTER, val)),
                )
            }
            Self::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string(), None),
            Self::Panicked(_) | Self::Inner(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), None)
            }
        };

        let mut response = (status, msg).into_response();
        if let Some((name, value)) = headers {
            response.headers_mut().insert(name, value);
        }
        response
    }
}
