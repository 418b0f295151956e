use std::sync::LazyLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;

#[derive(Clone, Debug)]
pub(crate) struct Instruments {
    pub(crate) throttle_rejected: Counter<u64>,
    pub(crate) body_limit_exceeded: Counter<u64>,
    pub(crate) protect_rejected: Counter<u64>,
    pub(crate) runtime_deferred_cancel: Counter<u64>,
    pub(crate) recovered_panics: Counter<u64>,
}

static INSTRUMENTS: LazyLock<Instruments> = LazyLock::new(|| {
    let meter = global::meter("tower_serve");
    Instruments {
        throttle_rejected: meter.u64_counter("throttle_rejected").build(),
        body_limit_exceeded: meter.u64_counter("body_limit_exceeded").build(),
        protect_rejected: meter.u64_counter("protect_rejected").build(),
        runtime_deferred_cancel: meter.u64_counter("runtime_deferred_cancel").build(),
        recovered_panics: meter.u64_counter("recovered_panics").build(),
    }
});

/// Counters shared by every layer, created on first use.
pub(crate) fn instruments() -> &'static Instruments {
    &INSTRUMENTS
}
