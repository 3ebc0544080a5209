//! OpenTelemetry instruments for the engine controller
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until a meter provider is installed by telemetry setup.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("engine-controller"));

/// Counter of worker pods successfully submitted
pub static SUBMITTED_RUNS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("engine_controller_submitted_runs_total")
        .with_description("Number of test runs submitted to worker pods")
        .with_unit("{runs}")
        .build()
});

/// Counter of runs failed because no worker could be launched
pub static LAUNCH_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("engine_controller_launch_failures_total")
        .with_description("Number of runs marked EnvFail after exhausting launch attempts")
        .with_unit("{runs}")
        .build()
});

/// Counter of interrupt events processed
///
/// Labels:
/// - `reason`: Cancelled, Requeued, Hung, or the unrecognised reason
pub static INTERRUPTS_PROCESSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("engine_controller_interrupts_processed_total")
        .with_description("Number of run interrupt events processed")
        .with_unit("{events}")
        .build()
});

/// Counter of terminated worker pods deleted
pub static PODS_CLEANED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("engine_controller_pods_cleaned_total")
        .with_description("Number of terminated worker pods deleted")
        .with_unit("{pods}")
        .build()
});

/// Record a successful worker submission
pub fn record_submitted() {
    SUBMITTED_RUNS.add(1, &[]);
}

/// Record a run given up on after exhausting launch attempts
pub fn record_launch_failure() {
    LAUNCH_FAILURES.add(1, &[]);
}

/// Record a processed interrupt event
pub fn record_interrupt(reason: &str) {
    INTERRUPTS_PROCESSED.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a deleted worker pod
pub fn record_pod_cleaned() {
    PODS_CLEANED.add(1, &[]);
}
