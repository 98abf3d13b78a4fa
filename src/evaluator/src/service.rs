//! # Evaluator Service
//!
//! The periodic pass over every recently-probed (agent, target) pair:
//! bulk-read stats, baselines and prior states, run the pure evaluation
//! core, bulk-write the new states and touch target response timestamps.
//! A separate job recalculates baselines from trailing successes; it takes
//! the same advisory lock as the tick so the two never interleave writes.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_store::{
    AlertConfigStore, BaselineStore, PairKey, PairStateStore, PairStatus, ResultStore, Store,
    TargetId, TargetResponseTouch, TargetStore,
};

use crate::baseline::compute_baseline;
use crate::evaluate::{advance, judge};
use crate::metrics;
use crate::types::{EvaluatorConfig, EvaluatorError, EvaluatorThresholds, TickSummary};

pub struct Evaluator {
    store: Arc<dyn Store>,
    config: EvaluatorConfig,
    // Manual recalculation is mutually exclusive with the tick.
    recalc_lock: Mutex<()>,
}

impl Evaluator {
    pub fn new(store: Arc<dyn Store>, config: EvaluatorConfig) -> Self {
        Self {
            store,
            config,
            recalc_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// One evaluation pass.
    pub async fn run_tick(&self) -> Result<TickSummary, EvaluatorError> {
        let _guard = self.recalc_lock.lock().await;
        let now = Utc::now();
        let timer = metrics::tick_timer();
        let window_start = now - Duration::seconds(self.config.window_secs);

        let pairs = self.store.active_pairs_since(window_start).await?;
        if pairs.is_empty() {
            return Ok(TickSummary::default());
        }

        let stats = self.store.bulk_pair_window_stats(&pairs, window_start).await?;
        let baselines = self.store.bulk_get_baselines(&pairs).await?;
        let prior_states = self.store.bulk_get_pair_states(&pairs).await?;
        let alert_config = self.store.get_alert_config().await?;
        let thresholds = EvaluatorThresholds::from(&alert_config);

        let baselines: HashMap<PairKey, _> =
            baselines.into_iter().map(|b| (b.key(), b)).collect();
        let prior_states: HashMap<PairKey, _> =
            prior_states.into_iter().map(|s| (s.key(), s)).collect();

        // Expected outcomes come from the target rows.
        let targets = self.store.list_targets().await?;
        let expected: HashMap<TargetId, _> = targets
            .iter()
            .filter_map(|t| t.expected_outcome.map(|e| (t.id, e)))
            .collect();

        let mut new_states = Vec::with_capacity(stats.len());
        let mut touches: HashMap<TargetId, TargetResponseTouch> = HashMap::new();
        let mut anomalies = 0usize;

        for stat in &stats {
            let key = stat.key();
            let baseline = baselines.get(&key);
            let verdict = judge(
                stat,
                baseline,
                expected.get(&stat.target_id),
                &thresholds,
            );
            if verdict.anomalous {
                anomalies += 1;
            }
            let state = advance(prior_states.get(&key), stat, verdict, &thresholds, now);
            self.merge_touch(&mut touches, stat, verdict.baseline_valid, now);
            new_states.push(state);
        }

        let written = new_states.len();
        self.store.bulk_upsert_pair_states(new_states).await?;
        self.store
            .bulk_touch_target_responses(touches.into_values().collect())
            .await?;

        drop(timer);
        metrics::record_tick(stats.len(), anomalies);
        debug!(pairs = stats.len(), anomalies, "evaluation tick complete");
        Ok(TickSummary {
            pairs_evaluated: stats.len(),
            anomalies,
            states_written: written,
        })
    }

    fn merge_touch(
        &self,
        touches: &mut HashMap<TargetId, TargetResponseTouch>,
        stat: &sentinel_store::PairWindowStats,
        baseline_valid: bool,
        now: DateTime<Utc>,
    ) {
        let responded_at = if stat.success_count > 0 {
            stat.last_probe_time
        } else {
            None
        };
        let entry = touches.entry(stat.target_id).or_insert(TargetResponseTouch {
            target_id: stat.target_id,
            responded_at: None,
            baseline_established_at: None,
        });
        if let Some(at) = responded_at {
            if entry.responded_at.map(|prev| at > prev).unwrap_or(true) {
                entry.responded_at = Some(at);
            }
        }
        if baseline_valid && entry.baseline_established_at.is_none() {
            entry.baseline_established_at = Some(now);
        }
    }

    /// Recalculate baselines for every pair with recent traffic from the
    /// trailing window of successful probes.
    pub async fn recalculate_baselines(&self) -> Result<usize, EvaluatorError> {
        let _guard = self.recalc_lock.lock().await;
        let now = Utc::now();
        let since = now - Duration::days(self.config.baseline_window_days);

        let pairs = self.store.active_pairs_since(since).await?;
        let mut updated = 0;
        let mut batch = Vec::with_capacity(256);
        for pair in pairs {
            let samples = self.store.pair_baseline_samples(pair, since).await?;
            if let Some(baseline) = compute_baseline(pair, &samples, now) {
                batch.push(baseline);
                updated += 1;
            }
            if batch.len() >= 256 {
                self.store.bulk_upsert_baselines(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            self.store.bulk_upsert_baselines(batch).await?;
        }
        info!(updated, "baseline recalculation complete");
        Ok(updated)
    }

    /// Degraded/down pair count snapshot, handy for health endpoints.
    pub async fn unhealthy_pairs(&self) -> Result<usize, EvaluatorError> {
        Ok(self
            .store
            .list_non_healthy_states()
            .await?
            .iter()
            .filter(|s| s.status != PairStatus::Unknown)
            .count())
    }
}

/// Periodic evaluation loop.
pub async fn run_evaluator_worker(
    evaluator: Arc<Evaluator>,
    token: CancellationToken,
) -> Result<(), EvaluatorError> {
    let mut tick = interval(std::time::Duration::from_secs(evaluator.config().tick_secs));
    info!(tick_secs = evaluator.config().tick_secs, "evaluator started");
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = evaluator.run_tick().await {
            warn!(error = %e, "evaluation tick failed");
        }
    }
    info!("evaluator stopped");
    Ok(())
}

/// Baseline recalculation loop (default daily).
pub async fn run_baseline_worker(
    evaluator: Arc<Evaluator>,
    token: CancellationToken,
) -> Result<(), EvaluatorError> {
    let mut tick = interval(std::time::Duration::from_secs(
        evaluator.config().recalc_interval_secs,
    ));
    // The immediate first tick would race boot; consume it.
    tick.tick().await;
    info!(
        interval_secs = evaluator.config().recalc_interval_secs,
        "baseline worker started"
    );
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = evaluator.recalculate_baselines().await {
            warn!(error = %e, "baseline recalculation failed");
        }
    }
    info!("baseline worker stopped");
    Ok(())
}
