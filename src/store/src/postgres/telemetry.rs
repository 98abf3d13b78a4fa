//! Probe result, baseline and pair-state persistence, plus the compiled
//! metrics query over the aggregate views.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashMap;

use super::rows;
use super::{enum_str, map_sqlx, PgStore};
use crate::query::{
    auto_bucket, select_aggregate_level, FilterOp, GroupBy, Metric, MetricsQuery, MetricsRow,
    TagFilter,
};
use crate::store::{chunk_pairs, BaselineStore, PairStateStore, ResultStore};
use crate::types::*;

/// Probe-result rows per INSERT statement (11 binds per row keeps each
/// statement far below the protocol parameter ceiling).
const RESULT_INSERT_CHUNK: usize = 5_000;

fn pair_arrays(pairs: &[PairKey]) -> (Vec<AgentId>, Vec<TargetId>) {
    (
        pairs.iter().map(|p| p.agent_id).collect(),
        pairs.iter().map(|p| p.target_id).collect(),
    )
}

#[async_trait]
impl ResultStore for PgStore {
    async fn bulk_insert_results(&self, results: Vec<ProbeResult>) -> StoreResult<u64> {
        if results.is_empty() {
            return Ok(0);
        }

        // Enrichment joins, resolved once per call: agent -> region and
        // target -> subnet -> region.
        let agent_ids: Vec<AgentId> = {
            let mut ids: Vec<AgentId> = results.iter().map(|r| r.agent_id).collect();
            ids.sort();
            ids.dedup();
            ids
        };
        let target_ids: Vec<TargetId> = {
            let mut ids: Vec<TargetId> = results.iter().map(|r| r.target_id).collect();
            ids.sort();
            ids.dedup();
            ids
        };

        let agent_regions: HashMap<AgentId, String> =
            sqlx::query_as::<_, (AgentId, String)>(
                "SELECT id, region FROM agents WHERE id = ANY($1)",
            )
            .bind(&agent_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .into_iter()
            .collect();

        let target_regions: HashMap<TargetId, Option<String>> =
            sqlx::query_as::<_, (TargetId, Option<String>)>(
                r#"SELECT t.id, s.region FROM targets t
                   LEFT JOIN subnets s ON s.id = t.subnet_id
                   WHERE t.id = ANY($1)"#,
            )
            .bind(&target_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .into_iter()
            .collect();

        let mut inserted = 0u64;
        for chunk in results.chunks(RESULT_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO probe_results \
                 (time, target_id, agent_id, success, error, latency_ms, \
                  packet_loss_pct, payload, agent_region, target_region, is_in_market) ",
            );
            builder.push_values(chunk, |mut b, r| {
                let agent_region = agent_regions
                    .get(&r.agent_id)
                    .filter(|s| !s.is_empty())
                    .cloned();
                let target_region = target_regions
                    .get(&r.target_id)
                    .cloned()
                    .flatten()
                    .filter(|s| !s.is_empty());
                let is_in_market = match (&agent_region, &target_region) {
                    (Some(a), Some(t)) => a == t,
                    _ => false,
                };
                b.push_bind(r.time)
                    .push_bind(r.target_id)
                    .push_bind(r.agent_id)
                    .push_bind(r.success)
                    .push_bind(r.error.clone())
                    .push_bind(r.latency_ms)
                    .push_bind(r.packet_loss_pct)
                    .push_bind(r.payload.clone())
                    .push_bind(agent_region)
                    .push_bind(target_region)
                    .push_bind(is_in_market);
            });
            builder.push(" ON CONFLICT (time, target_id, agent_id) DO NOTHING");
            let done = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            inserted += done.rows_affected();
        }
        Ok(inserted)
    }

    async fn active_pairs_since(&self, window_start: DateTime<Utc>) -> StoreResult<Vec<PairKey>> {
        let rows: Vec<(AgentId, TargetId)> = sqlx::query_as(
            r#"SELECT DISTINCT r.agent_id, r.target_id
               FROM probe_results r
               JOIN agents a ON a.id = r.agent_id AND a.archived_at IS NULL
               JOIN targets t ON t.id = r.target_id AND t.archived_at IS NULL
               WHERE r.time >= $1
               ORDER BY r.target_id, r.agent_id"#,
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|(agent_id, target_id)| PairKey {
                agent_id,
                target_id,
            })
            .collect())
    }

    async fn bulk_pair_window_stats(
        &self,
        pairs: &[PairKey],
        window_start: DateTime<Utc>,
    ) -> StoreResult<Vec<PairWindowStats>> {
        let mut out = Vec::with_capacity(pairs.len());
        for chunk in chunk_pairs(pairs) {
            let (agent_ids, target_ids) = pair_arrays(chunk);

            let agg = sqlx::query(
                r#"SELECT r.agent_id, r.target_id,
                          count(*) AS sample_count,
                          count(*) FILTER (WHERE r.success) AS success_count,
                          avg(r.latency_ms) AS avg_latency_ms,
                          COALESCE(avg(r.packet_loss_pct),
                                   (count(*) FILTER (WHERE NOT r.success))::float8
                                       * 100.0 / count(*)) AS packet_loss_pct
                   FROM probe_results r
                   JOIN unnest($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
                     ON p.agent_id = r.agent_id AND p.target_id = r.target_id
                   WHERE r.time >= $3
                   GROUP BY r.agent_id, r.target_id"#,
            )
            .bind(&agent_ids)
            .bind(&target_ids)
            .bind(window_start)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

            let last = sqlx::query(
                r#"SELECT DISTINCT ON (r.agent_id, r.target_id)
                          r.agent_id, r.target_id, r.time, r.latency_ms, r.success
                   FROM probe_results r
                   JOIN unnest($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
                     ON p.agent_id = r.agent_id AND p.target_id = r.target_id
                   WHERE r.time >= $3
                   ORDER BY r.agent_id, r.target_id, r.time DESC"#,
            )
            .bind(&agent_ids)
            .bind(&target_ids)
            .bind(window_start)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

            let mut last_by_pair: HashMap<PairKey, (DateTime<Utc>, Option<f64>, bool)> =
                HashMap::new();
            for row in &last {
                let key = PairKey {
                    agent_id: row.try_get("agent_id").map_err(map_sqlx)?,
                    target_id: row.try_get("target_id").map_err(map_sqlx)?,
                };
                last_by_pair.insert(
                    key,
                    (
                        row.try_get("time").map_err(map_sqlx)?,
                        row.try_get("latency_ms").map_err(map_sqlx)?,
                        row.try_get("success").map_err(map_sqlx)?,
                    ),
                );
            }

            for row in &agg {
                let key = PairKey {
                    agent_id: row.try_get("agent_id").map_err(map_sqlx)?,
                    target_id: row.try_get("target_id").map_err(map_sqlx)?,
                };
                let tail = last_by_pair.get(&key);
                out.push(PairWindowStats {
                    agent_id: key.agent_id,
                    target_id: key.target_id,
                    sample_count: row.try_get::<i64, _>("sample_count").map_err(map_sqlx)? as u64,
                    success_count: row.try_get::<i64, _>("success_count").map_err(map_sqlx)?
                        as u64,
                    avg_latency_ms: row.try_get("avg_latency_ms").map_err(map_sqlx)?,
                    last_latency_ms: tail.and_then(|(_, lat, _)| *lat),
                    packet_loss_pct: row.try_get("packet_loss_pct").map_err(map_sqlx)?,
                    last_probe_time: tail.map(|(t, _, _)| *t),
                    last_success: tail.map(|(_, _, s)| *s),
                });
            }
        }
        Ok(out)
    }

    async fn pair_baseline_samples(
        &self,
        pair: PairKey,
        since: DateTime<Utc>,
    ) -> StoreResult<BaselineSamples> {
        let result_rows = sqlx::query(
            r#"SELECT time, success, latency_ms, packet_loss_pct
               FROM probe_results
               WHERE agent_id = $1 AND target_id = $2 AND time >= $3
               ORDER BY time"#,
        )
        .bind(pair.agent_id)
        .bind(pair.target_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut samples = BaselineSamples::default();
        for row in &result_rows {
            let time: DateTime<Utc> = row.try_get("time").map_err(map_sqlx)?;
            let success: bool = row.try_get("success").map_err(map_sqlx)?;
            samples.total_count += 1;
            if samples.first_seen.is_none() {
                samples.first_seen = Some(time);
            }
            if success {
                samples.success_count += 1;
                if let Some(lat) = row
                    .try_get::<Option<f64>, _>("latency_ms")
                    .map_err(map_sqlx)?
                {
                    samples.latencies_ms.push(lat);
                }
                samples.loss_values_pct.push(
                    row.try_get::<Option<f64>, _>("packet_loss_pct")
                        .map_err(map_sqlx)?
                        .unwrap_or(0.0),
                );
            }
        }
        Ok(samples)
    }

    async fn list_results_for_target(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ProbeResult>> {
        sqlx::query(
            r#"SELECT * FROM probe_results
               WHERE target_id = $1 AND time >= $2
               ORDER BY time DESC LIMIT $3"#,
        )
        .bind(target_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::probe_result)
        .collect()
    }

    async fn metrics_query(&self, query: &MetricsQuery) -> StoreResult<Vec<MetricsRow>> {
        let now = Utc::now();
        let (start, end) = query.range.resolve(now)?;
        let window = end - start;
        let bucket_override = query.bucket.map(chrono::Duration::seconds);
        let level = select_aggregate_level(window, bucket_override);
        let bucket = bucket_override.unwrap_or_else(|| auto_bucket(window, level));
        let bucket_secs = bucket.num_seconds().max(1);

        let needs_agent_join = !query.agent_filter.providers.is_empty()
            || !query.agent_filter.tag_filters.is_empty()
            || query.group_by.contains(&GroupBy::AgentProvider);
        let needs_target_join = !query.target_filter.tiers.is_empty()
            || !query.target_filter.tag_filters.is_empty()
            || query.group_by.contains(&GroupBy::TargetTier);

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT to_timestamp(floor(extract(epoch FROM r.bucket) / ",
        );
        builder.push_bind(bucket_secs as f64);
        builder.push(") * ");
        builder.push_bind(bucket_secs as f64);
        builder.push(") AS bucket_ts");

        let mut dims: Vec<(&'static str, String)> = Vec::new();
        for g in &query.group_by {
            let (alias, expr) = match g {
                GroupBy::Time => continue,
                GroupBy::Agent => ("agent", "r.agent_id::text"),
                GroupBy::AgentRegion => ("agent_region", "COALESCE(r.agent_region, '')"),
                GroupBy::AgentProvider => ("agent_provider", "COALESCE(ag.provider, '')"),
                GroupBy::Target => ("target", "r.target_id::text"),
                GroupBy::TargetTier => ("target_tier", "COALESCE(tg.tier, '')"),
                GroupBy::TargetRegion => ("target_region", "COALESCE(r.target_region, '')"),
            };
            builder.push(format!(", {expr} AS dim_{alias}"));
            dims.push((alias, format!("dim_{alias}")));
        }

        // Percentiles and jitter are probe-count-weighted re-aggregations of
        // the per-bucket values; min/max and counts are exact.
        for metric in &query.metrics {
            let expr = match metric {
                Metric::AvgLatency => {
                    "sum(r.avg_latency_ms * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::MinLatency => "min(r.min_latency_ms)",
                Metric::MaxLatency => "max(r.max_latency_ms)",
                Metric::P50Latency => {
                    "sum(r.p50_latency_ms * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::P95Latency => {
                    "sum(r.p95_latency_ms * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::P99Latency => {
                    "sum(r.p99_latency_ms * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::Jitter => {
                    "sum(r.jitter_ms * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::PacketLoss => {
                    "sum(r.avg_packet_loss_pct * r.probe_count) / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::SuccessRate => {
                    "sum(r.success_count)::float8 * 100.0 / NULLIF(sum(r.probe_count), 0)"
                }
                Metric::ProbeCount => "sum(r.probe_count)::float8",
            };
            builder.push(format!(", {expr} AS m_{}", enum_str(metric)));
        }

        builder.push(format!(" FROM {} r", level.table()));
        if needs_agent_join {
            builder.push(" JOIN agents ag ON ag.id = r.agent_id");
        }
        if needs_target_join {
            builder.push(" JOIN targets tg ON tg.id = r.target_id");
        }

        builder.push(" WHERE r.bucket >= ");
        builder.push_bind(start);
        builder.push(" AND r.bucket < ");
        builder.push_bind(end);

        let af = &query.agent_filter;
        if !af.ids.is_empty() {
            builder.push(" AND r.agent_id = ANY(");
            builder.push_bind(af.ids.clone());
            builder.push(")");
        }
        if !af.regions.is_empty() {
            builder.push(" AND r.agent_region = ANY(");
            builder.push_bind(af.regions.clone());
            builder.push(")");
        }
        if !af.providers.is_empty() {
            builder.push(" AND ag.provider = ANY(");
            builder.push_bind(af.providers.clone());
            builder.push(")");
        }
        for tf in &af.tag_filters {
            push_tag_filter(&mut builder, "ag.tags", tf)?;
        }

        let tf_ = &query.target_filter;
        if !tf_.ids.is_empty() {
            builder.push(" AND r.target_id = ANY(");
            builder.push_bind(tf_.ids.clone());
            builder.push(")");
        }
        if !tf_.tiers.is_empty() {
            builder.push(" AND tg.tier = ANY(");
            builder.push_bind(tf_.tiers.clone());
            builder.push(")");
        }
        if !tf_.regions.is_empty() {
            builder.push(" AND r.target_region = ANY(");
            builder.push_bind(tf_.regions.clone());
            builder.push(")");
        }
        for tf in &tf_.tag_filters {
            push_tag_filter(&mut builder, "tg.tags", tf)?;
        }

        builder.push(" GROUP BY bucket_ts");
        for (_, alias) in &dims {
            builder.push(format!(", {alias}"));
        }
        builder.push(" ORDER BY bucket_ts");

        let result_rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut out = Vec::with_capacity(result_rows.len());
        for row in &result_rows {
            let mut dimensions = HashMap::new();
            for (name, alias) in &dims {
                let value: String = row.try_get(alias.as_str()).map_err(map_sqlx)?;
                dimensions.insert(name.to_string(), value);
            }
            let mut values = HashMap::new();
            for metric in &query.metrics {
                let alias = format!("m_{}", enum_str(metric));
                if let Some(v) = row
                    .try_get::<Option<f64>, _>(alias.as_str())
                    .map_err(map_sqlx)?
                {
                    values.insert(*metric, v);
                }
            }
            out.push(MetricsRow {
                bucket_start: row.try_get("bucket_ts").map_err(map_sqlx)?,
                dimensions,
                values,
            });
        }
        Ok(out)
    }

    async fn prune_results(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let done = sqlx::query("DELETE FROM probe_results WHERE time < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected())
    }
}

/// Push a jsonb tag predicate. `column` is a trusted table alias.
fn push_tag_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    tf: &TagFilter,
) -> StoreResult<()> {
    let first = tf.values.first().cloned().unwrap_or_default();
    let expr = format!("{column}->>");
    match tf.op {
        FilterOp::Equals => {
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" = ");
            builder.push_bind(first);
        }
        FilterOp::NotEquals => {
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" IS DISTINCT FROM ");
            builder.push_bind(first);
        }
        FilterOp::Contains => {
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" LIKE '%' || ");
            builder.push_bind(first);
            builder.push(" || '%'");
        }
        FilterOp::NotContains => {
            builder.push(format!(" AND ({expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" IS NULL OR ");
            builder.push(format!("{expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" NOT LIKE '%' || ");
            builder.push_bind(first);
            builder.push(" || '%')");
        }
        FilterOp::StartsWith => {
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" LIKE ");
            builder.push_bind(first);
            builder.push(" || '%'");
        }
        FilterOp::In => {
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" = ANY(");
            builder.push_bind(tf.values.clone());
            builder.push(")");
        }
        FilterOp::NotIn => {
            builder.push(format!(" AND ({expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" IS NULL OR NOT ");
            builder.push(format!("{expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" = ANY(");
            builder.push_bind(tf.values.clone());
            builder.push("))");
        }
        FilterOp::Regex => {
            regex::Regex::new(&first)
                .map_err(|e| StoreError::InvalidInput(format!("bad regex: {e}")))?;
            builder.push(format!(" AND {expr}"));
            builder.push_bind(tf.key.clone());
            builder.push(" ~ ");
            builder.push_bind(first);
        }
    }
    Ok(())
}

#[async_trait]
impl BaselineStore for PgStore {
    async fn get_baseline(&self, pair: PairKey) -> StoreResult<Option<PairBaseline>> {
        sqlx::query("SELECT * FROM agent_target_baseline WHERE agent_id = $1 AND target_id = $2")
            .bind(pair.agent_id)
            .bind(pair.target_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::pair_baseline(&row))
            .transpose()
    }

    async fn bulk_get_baselines(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairBaseline>> {
        let mut out = Vec::new();
        for chunk in chunk_pairs(pairs) {
            let (agent_ids, target_ids) = pair_arrays(chunk);
            let fetched = sqlx::query(
                r#"SELECT b.* FROM agent_target_baseline b
                   JOIN unnest($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
                     ON p.agent_id = b.agent_id AND p.target_id = b.target_id"#,
            )
            .bind(&agent_ids)
            .bind(&target_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            for row in &fetched {
                out.push(rows::pair_baseline(row)?);
            }
        }
        Ok(out)
    }

    async fn bulk_upsert_baselines(&self, baselines: Vec<PairBaseline>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for b in baselines {
            sqlx::query(
                r#"INSERT INTO agent_target_baseline
                   (agent_id, target_id, latency_p50, latency_p95, latency_p99,
                    latency_stddev, packet_loss_baseline, sample_count, first_seen,
                    last_updated)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                   ON CONFLICT (agent_id, target_id) DO UPDATE SET
                     latency_p50 = EXCLUDED.latency_p50,
                     latency_p95 = EXCLUDED.latency_p95,
                     latency_p99 = EXCLUDED.latency_p99,
                     latency_stddev = EXCLUDED.latency_stddev,
                     packet_loss_baseline = EXCLUDED.packet_loss_baseline,
                     sample_count = EXCLUDED.sample_count,
                     last_updated = EXCLUDED.last_updated"#,
            )
            .bind(b.agent_id)
            .bind(b.target_id)
            .bind(b.latency_p50)
            .bind(b.latency_p95)
            .bind(b.latency_p99)
            .bind(b.latency_stddev)
            .bind(b.packet_loss_baseline)
            .bind(b.sample_count as i64)
            .bind(b.first_seen)
            .bind(b.last_updated)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_baselines_for_target(&self, target_id: TargetId) -> StoreResult<()> {
        sqlx::query("DELETE FROM agent_target_baseline WHERE target_id = $1")
            .bind(target_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PairStateStore for PgStore {
    async fn get_pair_state(&self, pair: PairKey) -> StoreResult<Option<PairState>> {
        sqlx::query("SELECT * FROM agent_target_state WHERE agent_id = $1 AND target_id = $2")
            .bind(pair.agent_id)
            .bind(pair.target_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::pair_state(&row))
            .transpose()
    }

    async fn bulk_get_pair_states(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairState>> {
        let mut out = Vec::new();
        for chunk in chunk_pairs(pairs) {
            let (agent_ids, target_ids) = pair_arrays(chunk);
            let fetched = sqlx::query(
                r#"SELECT s.* FROM agent_target_state s
                   JOIN unnest($1::uuid[], $2::uuid[]) AS p(agent_id, target_id)
                     ON p.agent_id = s.agent_id AND p.target_id = s.target_id"#,
            )
            .bind(&agent_ids)
            .bind(&target_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            for row in &fetched {
                out.push(rows::pair_state(row)?);
            }
        }
        Ok(out)
    }

    async fn bulk_upsert_pair_states(&self, states: Vec<PairState>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for s in states {
            sqlx::query(
                r#"INSERT INTO agent_target_state
                   (agent_id, target_id, status, status_since, current_z_score,
                    current_packet_loss, current_latency_ms, anomaly_start,
                    consecutive_anomalies, consecutive_successes, last_probe_time,
                    last_evaluated)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (agent_id, target_id) DO UPDATE SET
                     status = EXCLUDED.status,
                     status_since = EXCLUDED.status_since,
                     current_z_score = EXCLUDED.current_z_score,
                     current_packet_loss = EXCLUDED.current_packet_loss,
                     current_latency_ms = EXCLUDED.current_latency_ms,
                     anomaly_start = EXCLUDED.anomaly_start,
                     consecutive_anomalies = EXCLUDED.consecutive_anomalies,
                     consecutive_successes = EXCLUDED.consecutive_successes,
                     last_probe_time = EXCLUDED.last_probe_time,
                     last_evaluated = EXCLUDED.last_evaluated"#,
            )
            .bind(s.agent_id)
            .bind(s.target_id)
            .bind(enum_str(&s.status))
            .bind(s.status_since)
            .bind(s.current_z_score)
            .bind(s.current_packet_loss)
            .bind(s.current_latency_ms)
            .bind(s.anomaly_start)
            .bind(s.consecutive_anomalies as i32)
            .bind(s.consecutive_successes as i32)
            .bind(s.last_probe_time)
            .bind(s.last_evaluated)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_non_healthy_states(&self) -> StoreResult<Vec<PairState>> {
        sqlx::query("SELECT * FROM agent_target_state WHERE status IN ('degraded', 'down')")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::pair_state)
            .collect()
    }

    async fn states_for_target(&self, target_id: TargetId) -> StoreResult<Vec<PairState>> {
        sqlx::query("SELECT * FROM agent_target_state WHERE target_id = $1")
            .bind(target_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::pair_state)
            .collect()
    }
}
