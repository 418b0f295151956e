//! # Tower Serve
//!
//! `tower-serve` bounds the lifecycle of HTTP requests in a
//! [Tower](https://github.com/tower-rs/tower) stack: how long a request may run,
//! how many requests may run at once, how fast one client may send them and how
//! much body a request may consume.
//!
//! ## Scopes
//!
//! Every request carries a cancellation [`Scope`] in its extensions. Stages derive
//! narrower scopes from it and handlers observe them through [`request_scope`]:
//!
//! - [`ScopeLayer`] ties requests to a long lived scope, such as server shutdown.
//! - [`TimeoutLayer`] stops the scope after a fixed duration.
//! - [`RuntimeLayer`] guarantees a minimum runtime during which the caller's
//!   cancellation is deferred, and enforces a maximum.
//!
//! None of these layers writes a response when a scope stops. Handlers decide what
//! to answer once they see their scope cancelled.
//!
//! ## Admission
//!
//! - [`ThrottleLayer`] bounds the number of active requests. Excess requests wait
//!   and are rejected with [`ServeError::TooManyRequests`] only if their scope stops
//!   first.
//! - [`ProtectLayer`] bounds the request rate of each client and rejects with
//!   [`ServeError::RateLimited`].
//!
//! ## Bodies
//!
//! [`LimitLayer`] wraps request bodies in a [`BodyLimiter`]. Reading beyond the
//! ceiling fails with [`BodyLimitExceeded`]; [`limit_body`] replaces the ceiling
//! for a single request. A body carries at most one limiter, so a second
//! `LimitLayer` replaces the ceiling of the first.
//!
//! ## Composition
//!
//! Layers stack with `tower::ServiceBuilder` as usual. For chains assembled at
//! runtime, [`compose`] joins [`Stage`]s and a terminal handler, and
//! [`ServeConfig`] builds the stages from configuration.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`ServeError`] (429, 413, 500) and keys
//!   [`ProtectLayer`] by `ConnectInfo<SocketAddr>`.

mod addr;
mod body;
mod compose;
mod config;
mod error;
mod limit;
mod metrics;
mod protect;
mod recover;
mod runtime;
mod scope;
mod throttle;
mod timeout;

#[cfg(test)]
mod tests;

pub use addr::ip;
pub use body::BodyLimitExceeded;
pub use body::BodyLimiter;
pub use body::OriginalBody;
pub use body::install_limit;
pub use body::is_body_limit_exceeded;
pub use body::limit_body;
pub use compose::ComposeError;
pub use compose::Handler;
pub use compose::Link;
pub use compose::Stage;
pub use compose::compose;
pub use config::ConfigError;
pub use config::LimitConfig;
pub use config::ProtectConfig;
pub use config::RuntimeConfig;
pub use config::ServeConfig;
pub use config::ThrottleConfig;
pub use config::TimeoutConfig;
pub use error::ServeError;
pub use limit::LimitLayer;
pub use limit::LimitService;
pub use protect::ProtectLayer;
pub use protect::ProtectService;
pub use protect::peer_ip;
pub use recover::RecoverLayer;
pub use recover::RecoverService;
pub use runtime::RuntimeFuture;
pub use runtime::RuntimeLayer;
pub use runtime::RuntimeService;
pub use runtime::WatchState;
pub use scope::ScopeLayer;
pub use scope::ScopeService;
pub use scope::ScopedFuture;
pub use scope::request_scope;
pub use throttle::ThrottleLayer;
pub use throttle::ThrottleService;
pub use timeout::TimeoutLayer;
pub use timeout::TimeoutService;

pub use serve_limit::ByteSize;
pub use serve_limit::CancelReason;
pub use serve_limit::InvalidByteSize;
pub use serve_limit::Scope;
pub use serve_limit::ScopeGuard;
pub use serve_limit::TokenPool;
