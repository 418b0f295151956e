//! # serve-limit
//!
//! `serve-limit` provides the primitives that bound a request's lifecycle:
//! how long it may run, how many requests may run at once, and how fast a
//! single client may send them.
//!
//! ## Core Philosophy
//!
//! Every primitive here is owned by exactly one concern. A [`Scope`] belongs to one
//! in-flight request (or a derived sub-unit of it), a [`TokenPool`] is shared by every
//! request passing through one middleware instance, and a [`Strategy`] decides on its
//! own, without background workers or timers, whether one more request fits.
//!
//! ## Key Concepts
//!
//! * **Scopes**: one-way, idempotent cancellation signals that form a tree. A derived
//!   scope is cancelled when its parent is, when its deadline passes, or when it is
//!   cancelled explicitly.
//! * **Tokens**: RAII permits from a fixed-size pool. Dropping a token returns it, even
//!   while unwinding from a panic.
//! * **Byte sizes**: human readable sizes (`4K`, `20MiB`, `5GB`) for body ceilings.
//! * **Strategy Trait**: a unified interface for rate limiting algorithms.
//!
//! ## Example
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! use serve_limit::Scope;
//! use serve_limit::TokenPool;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = TokenPool::new(NonZeroUsize::new(8).unwrap());
//! let scope = Scope::new().with_timeout(Duration::from_secs(1));
//!
//! if let Ok(_token) = pool.acquire(&scope).await {
//!     // Request is active until `_token` is dropped
//! }
//! # }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod byte_size;
mod gcra;
mod keyed;
mod pool;
mod scope;

pub use byte_size::ByteSize;
pub use byte_size::InvalidByteSize;
pub use gcra::Gcra;
pub use keyed::DEFAULT_KEY_CAPACITY;
pub use keyed::Keyed;
pub use pool::Rejected;
pub use pool::Token;
pub use pool::TokenPool;
pub use scope::CancelReason;
pub use scope::Cancelled;
pub use scope::Scope;
pub use scope::ScopeGuard;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, PartialEq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The core trait for all rate-limiting algorithms.
///
/// Strategies are shared across requests via `Arc`, so implementations keep their
/// state in atomics rather than behind `&mut self`.
pub trait Strategy: Debug {
    /// Attempts to admit a single request.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit has been reached.
    fn process(&self) -> ControlFlow<Reason>;
}
