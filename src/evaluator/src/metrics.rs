//! Prometheus metrics for the evaluation pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_histogram, Counter, Histogram, HistogramTimer,
};

lazy_static! {
    static ref PAIRS_EVALUATED: Counter = register_counter!(
        "evaluator_pairs_evaluated_total",
        "Total (agent, target) pairs evaluated"
    ).expect("Can't create pairs_evaluated metric");

    static ref ANOMALIES_DETECTED: Counter = register_counter!(
        "evaluator_anomalies_detected_total",
        "Total anomalous windows detected"
    ).expect("Can't create anomalies_detected metric");

    static ref TICK_DURATION_SECONDS: Histogram = register_histogram!(
        "evaluator_tick_duration_seconds",
        "Duration of evaluation ticks in seconds"
    ).expect("Can't create tick_duration metric");
}

pub(crate) fn record_tick(pairs: usize, anomalies: usize) {
    PAIRS_EVALUATED.inc_by(pairs as f64);
    ANOMALIES_DETECTED.inc_by(anomalies as f64);
}

pub(crate) fn tick_timer() -> HistogramTimer {
    TICK_DURATION_SECONDS.start_timer()
}
