use std::fmt;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use lru::LruCache;

use crate::Reason;
use crate::Strategy;

/// Number of distinct keys tracked by default before the least recently seen key
/// is forgotten.
pub const DEFAULT_KEY_CAPACITY: NonZeroUsize = NonZeroUsize::new(100_000).unwrap();

type Factory<S> = Box<dyn Fn() -> S + Send + Sync>;

/// One strategy per key (e.g. per client address), created on first sight.
///
/// The map is bounded: once `capacity` keys are tracked, the least recently seen
/// key is evicted and starts from a fresh strategy if it returns. The lock is held
/// only for the lookup; `process` runs on a shared handle.
pub struct Keyed<S> {
    strategies: Mutex<LruCache<String, Arc<S>>>,
    factory: Factory<S>,
}

impl<S: Strategy> Keyed<S> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::with_capacity(DEFAULT_KEY_CAPACITY, factory)
    }

    pub fn with_capacity<F>(capacity: NonZeroUsize, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            strategies: Mutex::new(LruCache::new(capacity)),
            factory: Box::new(factory),
        }
    }

    /// Run the strategy belonging to `key`.
    pub fn process(&self, key: &str) -> ControlFlow<Reason> {
        let strategy = {
            let mut strategies = self
                .strategies
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match strategies.get(key) {
                Some(strategy) => Arc::clone(strategy),
                None => {
                    let strategy = Arc::new((self.factory)());
                    strategies.put(key.to_owned(), Arc::clone(&strategy));
                    strategy
                }
            }
        };
        strategy.process()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> fmt::Debug for Keyed<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyed").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Gcra;

    fn per_minute(rate: usize) -> impl Fn() -> Gcra + Send + Sync + 'static {
        move || Gcra::new(NonZeroUsize::new(rate).unwrap(), Duration::from_secs(60))
    }

    #[test]
    fn keys_are_limited_independently() {
        let keyed = Keyed::new(per_minute(1));

        assert!(keyed.process("10.0.0.1").is_continue());
        assert!(keyed.process("10.0.0.1").is_break());
        assert!(keyed.process("10.0.0.2").is_continue());
        assert_eq!(keyed.len(), 2);
    }

    #[test]
    fn least_recently_seen_key_is_evicted() {
        let keyed = Keyed::with_capacity(NonZeroUsize::new(2).unwrap(), per_minute(1));

        assert!(keyed.process("a").is_continue());
        assert!(keyed.process("b").is_continue());
        assert!(keyed.process("c").is_continue());
        assert_eq!(keyed.len(), 2);

        // "a" was evicted, so it starts over with a fresh allowance.
        assert!(keyed.process("a").is_continue());
        assert!(keyed.process("c").is_break());
    }
}
