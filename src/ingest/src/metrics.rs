//! Prometheus metrics for the ingest pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
    HistogramTimer,
};

lazy_static! {
    /// Results accepted into the buffer and later flushed
    static ref RESULTS_FLUSHED: Counter = register_counter!(
        "ingest_results_flushed_total",
        "Total probe results flushed to the store"
    ).expect("Can't create results_flushed metric");

    /// Results deduplicated away by the store at insert
    static ref RESULTS_DEDUPED: Counter = register_counter!(
        "ingest_results_deduped_total",
        "Probe results discarded as (time, target, agent) duplicates"
    ).expect("Can't create results_deduped metric");

    /// Batches rejected because the buffer was full
    static ref BATCHES_REJECTED: Counter = register_counter!(
        "ingest_batches_rejected_total",
        "Result batches rejected with a retryable buffer-full error"
    ).expect("Can't create batches_rejected metric");

    /// Current buffered result count
    static ref BUFFER_DEPTH: Gauge = register_gauge!(
        "ingest_buffer_depth",
        "Probe results currently staged in the buffer"
    ).expect("Can't create buffer_depth metric");

    /// Flush latency
    static ref FLUSH_DURATION_SECONDS: Histogram = register_histogram!(
        "ingest_flush_duration_seconds",
        "Duration of bulk insert flushes in seconds"
    ).expect("Can't create flush_duration metric");
}

pub(crate) fn record_flush(staged: usize, inserted: u64) {
    RESULTS_FLUSHED.inc_by(inserted as f64);
    RESULTS_DEDUPED.inc_by(staged as f64 - inserted as f64);
}

pub(crate) fn record_rejected_batch(_size: usize) {
    BATCHES_REJECTED.inc();
}

pub(crate) fn set_buffer_depth(depth: usize) {
    BUFFER_DEPTH.set(depth as f64);
}

pub(crate) fn flush_timer() -> HistogramTimer {
    FLUSH_DURATION_SECONDS.start_timer()
}
