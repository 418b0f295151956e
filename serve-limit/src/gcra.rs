use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use crate::Reason;
use crate::Strategy;

/// Generic Cell Rate Algorithm.
///
/// Admits `rate` requests per `period`, with a burst of up to `rate` requests.
/// State is a single theoretical arrival time updated with a CAS loop.
#[derive(Debug)]
pub struct Gcra {
    /// Theoretical arrival time, in nanoseconds since `anchor`.
    tat: AtomicU64,
    emission_ns: u64,
    tolerance_ns: u64,
    clock: Clock,
    anchor: Instant,
}

impl Gcra {
    pub fn new(rate: NonZeroUsize, period: Duration) -> Self {
        Self::with_clock(rate, period, Clock::new())
    }

    /// Like [`Gcra::new`], reading time from `clock` (e.g. `Clock::mock()` in tests).
    pub fn with_clock(rate: NonZeroUsize, period: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        let period_ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);

        Self {
            tat: AtomicU64::new(0),
            emission_ns: (period_ns / rate.get() as u64).max(1),
            tolerance_ns: period_ns,
            clock,
            anchor,
        }
    }

    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }
}

impl Strategy for Gcra {
    #[inline]
    fn process(&self) -> ControlFlow<Reason> {
        let now = self.now_ns();

        loop {
            let tat = self.tat.load(Ordering::Acquire);
            let next_tat = tat.max(now).saturating_add(self.emission_ns);
            let horizon = now.saturating_add(self.tolerance_ns);

            if next_tat > horizon {
                return ControlFlow::Break(Reason::Overloaded {
                    retry_after: Duration::from_nanos(next_tat - horizon),
                });
            }

            if self
                .tat
                .compare_exchange_weak(tat, next_tat, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return ControlFlow::Continue(());
            }
        }
    }
}
