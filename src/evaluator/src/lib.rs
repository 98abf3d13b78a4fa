//! # Sentinel Evaluator
//!
//! Maintains per (agent, target) baselines and health state: a pure
//! anomaly predicate plus state machine, driven by a periodic bulk pass
//! over recently-probed pairs, and a trailing-window baseline
//! recalculation job.

pub mod baseline;
pub mod evaluate;
pub mod metrics;
pub mod service;
pub mod types;

pub use baseline::{compute_baseline, percentile, stddev};
pub use evaluate::{advance, judge, Verdict};
pub use service::{run_baseline_worker, run_evaluator_worker, Evaluator};
pub use types::{EvaluatorConfig, EvaluatorError, EvaluatorThresholds, TickSummary};
