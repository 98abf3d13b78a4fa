//! Evaluator configuration, thresholds and errors.

use chrono::Duration;
use sentinel_store::{AlertConfig, StoreError};
use thiserror::Error;

/// Evaluator service configuration
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Evaluation tick period in seconds
    pub tick_secs: u64,
    /// Recent-results window; at least three probe intervals of the
    /// densest tier
    pub window_secs: i64,
    /// Baseline recalculation cadence in seconds
    pub recalc_interval_secs: u64,
    /// Trailing window of successful probes feeding a baseline
    pub baseline_window_days: i64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            window_secs: 90,
            recalc_interval_secs: 86_400, // daily
            baseline_window_days: 7,
        }
    }
}

/// Threshold snapshot taken from the stored [`AlertConfig`] each tick
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorThresholds {
    pub zscore: f64,
    pub abs_latency_ms: f64,
    pub abs_loss_pct: f64,
    pub min_samples: u64,
    pub k_fail: u32,
    pub k_recover: u32,
    pub down_after: Duration,
}

impl From<&AlertConfig> for EvaluatorThresholds {
    fn from(config: &AlertConfig) -> Self {
        Self {
            zscore: config.zscore_threshold,
            abs_latency_ms: config.abs_latency_ms,
            abs_loss_pct: config.abs_loss_pct,
            min_samples: config.baseline_min_samples,
            k_fail: config.consecutive_failures,
            k_recover: config.consecutive_recoveries,
            down_after: Duration::seconds(config.down_after_secs),
        }
    }
}

/// Evaluator errors
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One tick's outcome
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub pairs_evaluated: usize,
    pub anomalies: usize,
    pub states_written: usize,
}
