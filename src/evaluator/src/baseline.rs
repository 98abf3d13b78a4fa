//! Baseline computation over trailing successful probes.

use chrono::{DateTime, Utc};

use sentinel_store::{BaselineSamples, PairBaseline, PairKey};

/// Sample standard deviation; zero for fewer than two samples.
pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Nearest-rank percentile over an unsorted slice.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Summarize a pair's trailing successful probes into a baseline. `None`
/// when no latency samples exist (nothing to summarize).
pub fn compute_baseline(
    pair: PairKey,
    samples: &BaselineSamples,
    now: DateTime<Utc>,
) -> Option<PairBaseline> {
    if samples.latencies_ms.is_empty() {
        return None;
    }
    let loss_baseline = if samples.loss_values_pct.is_empty() {
        0.0
    } else {
        samples.loss_values_pct.iter().sum::<f64>() / samples.loss_values_pct.len() as f64
    };
    Some(PairBaseline {
        agent_id: pair.agent_id,
        target_id: pair.target_id,
        latency_p50: percentile(&samples.latencies_ms, 50.0)?,
        latency_p95: percentile(&samples.latencies_ms, 95.0)?,
        latency_p99: percentile(&samples.latencies_ms, 99.0)?,
        latency_stddev: stddev(&samples.latencies_ms),
        packet_loss_baseline: loss_baseline,
        sample_count: samples.latencies_ms.len() as u64,
        first_seen: samples.first_seen.unwrap_or(now),
        last_updated: now,
    })
}
