//! Request and sub-call measurements of the dispatcher.
//!
//! The dispatcher reports through the [`MetricsSink`] trait. In production the
//! sink is [`OtelMetrics`], which records into OpenTelemetry instruments under
//! the `parhash` namespace:
//!
//! - `parhash.nr_requests` - incremented once per `ParallelHash` call, whether
//!   it succeeds or not.
//! - `parhash.subquery_durations` - backend call latency in milliseconds, with
//!   a `backend` attribute holding the configured backend address. Uses 24
//!   exponentially growing bucket boundaries from 0.1 ms to 10 s.
//!
//! Without a meter provider installed (see `telemetry`), the OpenTelemetry
//! instruments are no-ops.

use core::time::Duration;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

/// Instrumentation scope and metric name prefix.
pub const NAMESPACE: &str = "parhash";

/// Attribute key carrying the backend address on sub-call samples.
pub const BACKEND_LABEL: &str = "backend";

const SUBQUERY_BUCKET_COUNT: usize = 24;
const SUBQUERY_MIN_MS: f64 = 0.1;
const SUBQUERY_MAX_MS: f64 = 10_000.0;

/// Destination for dispatcher measurements.
pub trait MetricsSink: Send + Sync + 'static {
    /// Counts one top-level batch call.
    fn record_request(&self);

    /// Records the latency of one backend call, successful or not.
    fn record_subquery(&self, backend: &str, elapsed: Duration);
}

/// [`MetricsSink`] backed by OpenTelemetry instruments.
#[derive(Clone)]
pub struct OtelMetrics {
    requests: Counter<u64>,
    subquery_durations: Histogram<f64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        let requests = meter
            .u64_counter(format!("{NAMESPACE}.nr_requests"))
            .with_description("ParallelHash calls received")
            .build();

        let subquery_durations = meter
            .f64_histogram(format!("{NAMESPACE}.subquery_durations"))
            .with_unit("ms")
            .with_description("Duration of individual backend Hash calls")
            .with_boundaries(subquery_buckets())
            .build();

        Self {
            requests,
            subquery_durations,
        }
    }

    /// Builds the instruments from the globally installed meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(NAMESPACE))
    }
}

impl MetricsSink for OtelMetrics {
    fn record_request(&self) {
        self.requests.add(1, &[]);
    }

    fn record_subquery(&self, backend: &str, elapsed: Duration) {
        self.subquery_durations.record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new(BACKEND_LABEL, backend.to_string())],
        );
    }
}

/// Bucket boundaries of `parhash.subquery_durations`, in milliseconds.
pub fn subquery_buckets() -> Vec<f64> {
    exponential_buckets_range(SUBQUERY_MIN_MS, SUBQUERY_MAX_MS, SUBQUERY_BUCKET_COUNT)
}

/// Returns `count` boundaries growing by a constant factor from `min` to
/// `max`, both included.
///
/// # Panics
///
/// Panics if `count < 2`, `min <= 0` or `max <= min`.
pub fn exponential_buckets_range(min: f64, max: f64, count: usize) -> Vec<f64> {
    assert!(count >= 2, "need at least two buckets, got {count}");
    assert!(min > 0.0 && max > min, "invalid bucket range {min}..{max}");

    let factor = (max / min).powf(1.0 / (count - 1) as f64);
    let mut bounds = Vec::with_capacity(count);
    let mut bound = min;
    for _ in 0..count {
        bounds.push(bound);
        bound *= factor;
    }
    bounds
}
