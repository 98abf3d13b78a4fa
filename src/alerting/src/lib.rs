//! # Sentinel Alerting
//!
//! Append-only alert lifecycle over the evaluator's anomaly stream:
//! creation with enrichment snapshots, escalation with monotone peaks,
//! debounced updates, reopen grace, quorum auto-resolve and hot-spot
//! correlation views.

pub mod correlation;
pub mod engine;
pub mod metrics;
pub mod types;

pub use correlation::{correlation_key, hot_spots, HotSpot};
pub use engine::{run_alert_worker, AlertEngine};
pub use types::{
    auto_resolve_quorum, AlertTickSummary, AlertingConfig, AlertingError, AnomalySignal,
};
