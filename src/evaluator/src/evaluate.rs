//! # Pair Evaluation Core
//!
//! Pure functions from (baseline, prior state, window stats, expected
//! outcome) to the next pair state. No clock reads, no store calls; the
//! service layer feeds `now` in, which keeps every transition unit-testable.

use chrono::{DateTime, Utc};

use sentinel_store::{ExpectedOutcome, PairBaseline, PairState, PairStatus, PairWindowStats};

use crate::types::EvaluatorThresholds;

/// What the predicate concluded about one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub anomalous: bool,
    pub z_score: Option<f64>,
    /// True when the pair had a valid baseline to judge against
    pub baseline_valid: bool,
}

/// Anomaly predicate for one evaluation window.
///
/// With a valid baseline: anomalous when z > threshold, latency beyond p99,
/// or loss a full point above baseline. Below the sample floor: absolute
/// thresholds. For `should_succeed = false` targets the predicate inverts:
/// any successful probe is the anomaly.
pub fn judge(
    stats: &PairWindowStats,
    baseline: Option<&PairBaseline>,
    expected: Option<&ExpectedOutcome>,
    thresholds: &EvaluatorThresholds,
) -> Verdict {
    if let Some(expected) = expected {
        if !expected.should_succeed {
            return Verdict {
                anomalous: stats.success_count > 0,
                z_score: None,
                baseline_valid: false,
            };
        }
    }

    let baseline = baseline.filter(|b| b.sample_count >= thresholds.min_samples);
    let latency = stats.avg_latency_ms;

    match baseline {
        Some(baseline) => {
            let z = latency.map(|lat| {
                if baseline.latency_stddev > 0.0 {
                    (lat - baseline.latency_p50) / baseline.latency_stddev
                } else if lat > baseline.latency_p50 {
                    f64::INFINITY
                } else {
                    0.0
                }
            });
            let z_breach = z.map(|z| z > thresholds.zscore).unwrap_or(false);
            let p99_breach = latency.map(|lat| lat > baseline.latency_p99).unwrap_or(false);
            let loss_breach = stats.packet_loss_pct > baseline.packet_loss_baseline + 1.0;
            // A window with zero responses judges anomalous regardless.
            let silent = stats.sample_count > 0 && stats.success_count == 0;
            Verdict {
                anomalous: z_breach || p99_breach || loss_breach || silent,
                z_score: z.filter(|z| z.is_finite()),
                baseline_valid: true,
            }
        }
        None => {
            let latency_breach = latency.map(|lat| lat > thresholds.abs_latency_ms).unwrap_or(false);
            let loss_breach = stats.packet_loss_pct > thresholds.abs_loss_pct;
            Verdict {
                anomalous: latency_breach || loss_breach,
                z_score: None,
                baseline_valid: false,
            }
        }
    }
}

/// Fold one window's verdict into the pair state machine.
pub fn advance(
    prior: Option<&PairState>,
    stats: &PairWindowStats,
    verdict: Verdict,
    thresholds: &EvaluatorThresholds,
    now: DateTime<Utc>,
) -> PairState {
    let mut state = prior.cloned().unwrap_or(PairState {
        agent_id: stats.agent_id,
        target_id: stats.target_id,
        status: PairStatus::Unknown,
        status_since: now,
        current_z_score: None,
        current_packet_loss: 0.0,
        current_latency_ms: None,
        anomaly_start: None,
        consecutive_anomalies: 0,
        consecutive_successes: 0,
        last_probe_time: None,
        last_evaluated: now,
    });

    if verdict.anomalous {
        state.consecutive_anomalies += 1;
        state.consecutive_successes = 0;
    } else {
        state.consecutive_successes += 1;
        state.consecutive_anomalies = 0;
    }

    let next_status = match state.status {
        PairStatus::Unknown | PairStatus::Healthy => {
            if state.consecutive_anomalies >= thresholds.k_fail {
                PairStatus::Degraded
            } else if state.status == PairStatus::Unknown
                && state.consecutive_successes >= thresholds.k_recover
            {
                PairStatus::Healthy
            } else {
                state.status
            }
        }
        PairStatus::Degraded => {
            if state.consecutive_successes >= thresholds.k_recover {
                PairStatus::Healthy
            } else if verdict.anomalous
                && verdict.baseline_valid
                && now - state.status_since >= thresholds.down_after
            {
                PairStatus::Down
            } else {
                PairStatus::Degraded
            }
        }
        PairStatus::Down => {
            if state.consecutive_successes >= thresholds.k_recover {
                PairStatus::Healthy
            } else {
                PairStatus::Down
            }
        }
    };

    if next_status != state.status {
        state.status_since = now;
        match next_status {
            PairStatus::Degraded | PairStatus::Down => {
                if state.anomaly_start.is_none() {
                    state.anomaly_start = Some(now);
                }
            }
            PairStatus::Healthy | PairStatus::Unknown => {
                state.anomaly_start = None;
            }
        }
    }
    state.status = next_status;

    state.current_z_score = verdict.z_score;
    state.current_packet_loss = stats.packet_loss_pct;
    state.current_latency_ms = stats.avg_latency_ms;
    state.last_probe_time = stats.last_probe_time.or(state.last_probe_time);
    state.last_evaluated = now;
    state
}
