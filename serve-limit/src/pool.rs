use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;

use crate::Scope;

/// No token became available before the caller's scope stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no token became available before the scope was cancelled")]
pub struct Rejected;

/// A fixed-size pool of identical tokens.
///
/// Clones share the same tokens. The number of tokens in circulation (held plus
/// available) is always the capacity the pool was created with.
#[derive(Clone, Debug)]
pub struct TokenPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A token held by one caller. Dropping it returns the token to its pool.
///
/// Returning a token never blocks, so release is safe from `Drop` and while
/// unwinding.
#[derive(Debug)]
#[must_use = "the token is returned to the pool as soon as it is dropped"]
pub struct Token {
    _permit: OwnedSemaphorePermit,
}

impl TokenPool {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.get())),
            capacity: capacity.get(),
        }
    }

    /// Take a token, waiting until one is returned or `scope` stops.
    ///
    /// A token that is available right away is always taken, even when the scope
    /// has already stopped. Once this returns `Err(Rejected)` the caller holds
    /// nothing and never will from this call.
    pub async fn acquire(&self, scope: &Scope) -> Result<Token, Rejected> {
        if let Some(token) = self.try_acquire() {
            return Ok(token);
        }

        tokio::select! {
            biased;
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map(|permit| Token { _permit: permit }).map_err(|_| Rejected)
            }
            _ = scope.cancelled() => Err(Rejected),
        }
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> Option<Token> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Token { _permit: permit })
    }

    /// Tokens currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total tokens in circulation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use more_asserts::assert_le;
    use tokio::task::JoinSet;

    use super::*;

    fn pool(capacity: usize) -> TokenPool {
        TokenPool::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn tokens_are_returned_on_drop() {
        let pool = pool(2);

        let first = pool.try_acquire().expect("first token");
        let second = pool.try_acquire().expect("second token");
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(pool.available(), 1);
        drop(second);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn available_token_wins_over_cancelled_scope() {
        let pool = pool(1);
        let scope = Scope::new();
        scope.cancel();

        let token = pool.acquire(&scope).await;
        assert!(token.is_ok());
    }

    #[tokio::test]
    async fn waiter_receives_returned_token() {
        tokio::time::pause();

        let pool = pool(1);
        let held = pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&Scope::new()).await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().expect("token after release");
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_never_acquires_late() {
        tokio::time::pause();

        let pool = pool(1);
        let held = pool.try_acquire().unwrap();

        let scope = Scope::new().with_timeout(Duration::from_millis(5));
        assert_eq!(pool.acquire(&scope).await.unwrap_err(), Rejected);

        // The rejected caller must not be holding the token that comes back.
        drop(held);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn token_is_returned_when_holder_panics() {
        let pool = pool(1);

        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _token = pool.acquire(&Scope::new()).await.unwrap();
                if pool.available() == 0 {
                    panic!("handler failed");
                }
            })
        };

        assert!(holder.await.unwrap_err().is_panic());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hammer_never_exceeds_capacity() {
        let capacity = 3;
        let pool = pool(capacity);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..64 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let _token = pool.acquire(&Scope::new()).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("Task panicked");
        }

        assert_le!(peak.load(Ordering::SeqCst), capacity);
        assert_eq!(pool.available(), capacity);
    }
}
