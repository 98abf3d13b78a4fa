//! Subnet, target and tier persistence for the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::rows;
use super::{enum_str, map_sqlx, to_json, PgStore};
use crate::store::{SubnetStore, TargetStore, TierStore};
use crate::types::*;

#[async_trait]
impl SubnetStore for PgStore {
    async fn upsert_subnet(&self, subnet: Subnet) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let siblings = sqlx::query(
            "SELECT * FROM subnets WHERE source = $1 AND archived_at IS NULL AND id <> $2",
        )
        .bind(&subnet.source)
        .bind(subnet.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        for row in &siblings {
            let other = rows::subnet(row)?;
            if other.cidr.contains(&subnet.cidr.network())
                || subnet.cidr.contains(&other.cidr.network())
            {
                return Err(StoreError::Conflict(format!(
                    "subnet {} overlaps active subnet {} of source '{}'",
                    subnet.cidr, other.cidr, other.source
                )));
            }
        }

        sqlx::query(
            r#"INSERT INTO subnets
               (id, cidr, source, subscriber, service, location, pop, gateway_device,
                region, vlan, service_status, service_status_changed_at, archived_at,
                created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
               ON CONFLICT (id) DO UPDATE SET
                 cidr = EXCLUDED.cidr, source = EXCLUDED.source,
                 subscriber = EXCLUDED.subscriber, service = EXCLUDED.service,
                 location = EXCLUDED.location, pop = EXCLUDED.pop,
                 gateway_device = EXCLUDED.gateway_device, region = EXCLUDED.region,
                 vlan = EXCLUDED.vlan, service_status = EXCLUDED.service_status,
                 service_status_changed_at = EXCLUDED.service_status_changed_at,
                 archived_at = EXCLUDED.archived_at, updated_at = EXCLUDED.updated_at"#,
        )
        .bind(subnet.id)
        .bind(subnet.cidr.to_string())
        .bind(&subnet.source)
        .bind(&subnet.subscriber)
        .bind(&subnet.service)
        .bind(&subnet.location)
        .bind(&subnet.pop)
        .bind(&subnet.gateway_device)
        .bind(&subnet.region)
        .bind(subnet.vlan)
        .bind(enum_str(&subnet.service_status))
        .bind(subnet.service_status_changed_at)
        .bind(subnet.archived_at)
        .bind(subnet.created_at)
        .bind(subnet.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_subnet(&self, id: SubnetId) -> StoreResult<Option<Subnet>> {
        sqlx::query("SELECT * FROM subnets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::subnet(&row))
            .transpose()
    }

    async fn list_subnets(&self) -> StoreResult<Vec<Subnet>> {
        sqlx::query("SELECT * FROM subnets ORDER BY cidr")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::subnet)
            .collect()
    }

    async fn list_active_subnets(&self) -> StoreResult<Vec<Subnet>> {
        sqlx::query("SELECT * FROM subnets WHERE archived_at IS NULL ORDER BY cidr")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::subnet)
            .collect()
    }

    async fn find_subnet_containing(&self, ip: Ipv4Addr) -> StoreResult<Option<Subnet>> {
        // CIDRs are stored as text; containment is resolved in-process over
        // the active set, longest prefix winning.
        let subnets = self.list_active_subnets().await?;
        Ok(subnets
            .into_iter()
            .filter(|s| s.contains(ip))
            .max_by_key(|s| s.cidr.prefix_len()))
    }

    async fn set_subnet_service_status(
        &self,
        id: SubnetId,
        status: SubnetServiceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let done = sqlx::query(
            r#"UPDATE subnets
               SET service_status = $2, service_status_changed_at = $3, updated_at = $3
               WHERE id = $1 AND service_status <> $2"#,
        )
        .bind(id)
        .bind(enum_str(&status))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            // Either missing or already in the requested status.
            let exists: Option<(SubnetId,)> =
                sqlx::query_as("SELECT id FROM subnets WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            if exists.is_none() {
                return Err(StoreError::NotFound("subnet"));
            }
        }
        Ok(())
    }

    async fn set_subnet_archived(
        &self,
        id: SubnetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let done = sqlx::query("UPDATE subnets SET archived_at = $2 WHERE id = $1")
            .bind(id)
            .bind(archived_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("subnet"));
        }
        Ok(())
    }
}

fn bind_target_insert<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    target: &'q Target,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(target.id)
        .bind(target.ip.to_string())
        .bind(&target.tier)
        .bind(enum_str(&target.ownership))
        .bind(enum_str(&target.origin))
        .bind(enum_str(&target.ip_type))
        .bind(enum_str(&target.monitoring_state))
        .bind(target.state_changed_at)
        .bind(target.subnet_id)
        .bind(target.is_representative)
        .bind(target.needs_review)
        .bind(target.first_response_at)
        .bind(target.last_response_at)
        .bind(target.baseline_established_at)
        .bind(target.expected_outcome.as_ref().map(to_json))
        .bind(to_json(&target.tags))
        .bind(target.archived_at)
        .bind(target.created_at)
        .bind(target.updated_at)
}

#[async_trait]
impl TargetStore for PgStore {
    async fn insert_target(&self, target: Target) -> StoreResult<()> {
        let query = sqlx::query(
            r#"INSERT INTO targets
               (id, ip, tier, ownership, origin, ip_type, monitoring_state,
                state_changed_at, subnet_id, is_representative, needs_review,
                first_response_at, last_response_at, baseline_established_at,
                expected_outcome, tags, archived_at, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18, $19)"#,
        );
        bind_target_insert(query, &target)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_target(&self, target: Target) -> StoreResult<()> {
        // monitoring_state/state_changed_at go through transition_target_state.
        let done = sqlx::query(
            r#"UPDATE targets SET
                 ip = $2, tier = $3, ownership = $4, origin = $5, ip_type = $6,
                 subnet_id = $7, is_representative = $8, needs_review = $9,
                 expected_outcome = $10, tags = $11, archived_at = $12, updated_at = $13
               WHERE id = $1"#,
        )
        .bind(target.id)
        .bind(target.ip.to_string())
        .bind(&target.tier)
        .bind(enum_str(&target.ownership))
        .bind(enum_str(&target.origin))
        .bind(enum_str(&target.ip_type))
        .bind(target.subnet_id)
        .bind(target.is_representative)
        .bind(target.needs_review)
        .bind(target.expected_outcome.as_ref().map(to_json))
        .bind(to_json(&target.tags))
        .bind(target.archived_at)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("target"));
        }
        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> StoreResult<Option<Target>> {
        sqlx::query("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::target(&row))
            .transpose()
    }

    async fn get_target_by_ip(&self, ip: Ipv4Addr) -> StoreResult<Option<Target>> {
        sqlx::query("SELECT * FROM targets WHERE ip = $1 AND archived_at IS NULL")
            .bind(ip.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::target(&row))
            .transpose()
    }

    async fn list_targets(&self) -> StoreResult<Vec<Target>> {
        sqlx::query("SELECT * FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::target)
            .collect()
    }

    async fn list_targets_in_states(
        &self,
        states: &[MonitoringState],
    ) -> StoreResult<Vec<Target>> {
        let names: Vec<String> = states.iter().map(enum_str).collect();
        sqlx::query(
            r#"SELECT * FROM targets
               WHERE archived_at IS NULL AND monitoring_state = ANY($1)
               ORDER BY id"#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }

    async fn list_targets_in_subnet(&self, subnet_id: SubnetId) -> StoreResult<Vec<Target>> {
        sqlx::query("SELECT * FROM targets WHERE subnet_id = $1 ORDER BY id")
            .bind(subnet_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::target)
            .collect()
    }

    async fn set_target_archived(
        &self,
        id: TargetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let done = sqlx::query("UPDATE targets SET archived_at = $2 WHERE id = $1")
            .bind(id)
            .bind(archived_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("target"));
        }
        Ok(())
    }

    async fn transition_target_state(
        &self,
        id: TargetId,
        new_state: MonitoringState,
        reason: &str,
        triggered_by: &str,
        needs_review: Option<bool>,
    ) -> StoreResult<Target> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query("SELECT * FROM targets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let target = row
            .as_ref()
            .map(rows::target)
            .transpose()?
            .ok_or(StoreError::NotFound("target"))?;
        let old_state = target.monitoring_state;
        if old_state == new_state {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(target);
        }

        sqlx::query(
            r#"UPDATE targets SET
                 monitoring_state = $2, state_changed_at = $3, updated_at = $3,
                 needs_review = COALESCE($4, needs_review)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(enum_str(&new_state))
        .bind(now)
        .bind(needs_review)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            r#"INSERT INTO target_state_history
               (id, target_id, old_state, new_state, reason, triggered_by, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(enum_str(&old_state))
        .bind(enum_str(&new_state))
        .bind(reason)
        .bind(triggered_by)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            r#"INSERT INTO activity_log
               (id, target_id, subnet_id, agent_id, ip, category, event_type,
                details, triggered_by, severity, created_at)
               VALUES ($1, $2, $3, NULL, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(target.subnet_id)
        .bind(target.ip.to_string())
        .bind(enum_str(&ActivityCategory::Target))
        .bind("monitoring_state_changed")
        .bind(serde_json::json!({
            "old_state": old_state,
            "new_state": new_state,
            "reason": reason,
        }))
        .bind(triggered_by)
        .bind(enum_str(&ActivitySeverity::Info))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        let mut updated = target;
        updated.monitoring_state = new_state;
        updated.state_changed_at = now;
        updated.updated_at = now;
        if let Some(review) = needs_review {
            updated.needs_review = review;
        }
        Ok(updated)
    }

    async fn transition_targets_in_subnet(
        &self,
        subnet_id: SubnetId,
        from_states: &[MonitoringState],
        new_state: MonitoringState,
        reason: &str,
        triggered_by: &str,
    ) -> StoreResult<Vec<TargetId>> {
        let now = Utc::now();
        let names: Vec<String> = from_states.iter().map(enum_str).collect();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let affected = sqlx::query(
            r#"SELECT id, monitoring_state FROM targets
               WHERE subnet_id = $1 AND archived_at IS NULL
                 AND monitoring_state = ANY($2)
               FOR UPDATE"#,
        )
        .bind(subnet_id)
        .bind(&names)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let mut ids = Vec::with_capacity(affected.len());
        for row in &affected {
            let id: TargetId = sqlx::Row::try_get(row, "id").map_err(map_sqlx)?;
            let old: String = sqlx::Row::try_get(row, "monitoring_state").map_err(map_sqlx)?;
            ids.push(id);

            sqlx::query(
                r#"INSERT INTO target_state_history
                   (id, target_id, old_state, new_state, reason, triggered_by, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(&old)
            .bind(enum_str(&new_state))
            .bind(reason)
            .bind(triggered_by)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        sqlx::query(
            r#"UPDATE targets SET monitoring_state = $3, state_changed_at = $4, updated_at = $4
               WHERE id = ANY($1) AND monitoring_state = ANY($2)"#,
        )
        .bind(&ids)
        .bind(&names)
        .bind(enum_str(&new_state))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            r#"INSERT INTO activity_log
               (id, subnet_id, category, event_type, details, triggered_by, severity, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(Uuid::new_v4())
        .bind(subnet_id)
        .bind(enum_str(&ActivityCategory::Subnet))
        .bind("subnet_targets_transitioned")
        .bind(serde_json::json!({
            "new_state": new_state,
            "reason": reason,
            "target_count": ids.len(),
        }))
        .bind(triggered_by)
        .bind(enum_str(&ActivitySeverity::Info))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(ids)
    }

    async fn bulk_touch_target_responses(
        &self,
        touches: Vec<TargetResponseTouch>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for touch in touches {
            sqlx::query(
                r#"UPDATE targets SET
                     first_response_at = COALESCE(first_response_at, $2),
                     last_response_at = GREATEST(COALESCE(last_response_at, $2), $2),
                     baseline_established_at = COALESCE(baseline_established_at, $3)
                   WHERE id = $1"#,
            )
            .bind(touch.target_id)
            .bind(touch.responded_at)
            .bind(touch.baseline_established_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn set_representative(
        &self,
        subnet_id: SubnetId,
        target_id: TargetId,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("UPDATE targets SET is_representative = FALSE WHERE subnet_id = $1")
            .bind(subnet_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let done = sqlx::query(
            "UPDATE targets SET is_representative = TRUE WHERE id = $1 AND subnet_id = $2",
        )
        .bind(target_id)
        .bind(subnet_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("target"));
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_representative_candidates(
        &self,
        subnet_id: SubnetId,
    ) -> StoreResult<Vec<Target>> {
        sqlx::query(
            r#"SELECT * FROM targets
               WHERE subnet_id = $1 AND archived_at IS NULL
                 AND ip_type = 'customer' AND monitoring_state = 'standby'
                 AND baseline_established_at IS NOT NULL
               ORDER BY baseline_established_at"#,
        )
        .bind(subnet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }

    async fn target_state_history(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> StoreResult<Vec<TargetStateHistory>> {
        sqlx::query(
            r#"SELECT * FROM target_state_history
               WHERE target_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(target_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target_state_history)
        .collect()
    }

    async fn targets_eligible_for_down(
        &self,
        now: DateTime<Utc>,
        down_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        sqlx::query(
            r#"SELECT * FROM targets
               WHERE archived_at IS NULL AND monitoring_state = 'degraded'
                 AND baseline_established_at IS NOT NULL
                 AND last_response_at IS NOT NULL AND last_response_at <= $1"#,
        )
        .bind(now - down_after)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }

    async fn targets_eligible_for_unresponsive(
        &self,
        now: DateTime<Utc>,
        unresponsive_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        sqlx::query(
            r#"SELECT * FROM targets
               WHERE archived_at IS NULL AND monitoring_state = 'unknown'
                 AND first_response_at IS NULL AND created_at <= $1"#,
        )
        .bind(now - unresponsive_after)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }

    async fn targets_eligible_for_excluded(
        &self,
        now: DateTime<Utc>,
        exclude_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        sqlx::query(
            r#"SELECT * FROM targets
               WHERE archived_at IS NULL AND monitoring_state = 'down'
                 AND state_changed_at <= $1"#,
        )
        .bind(now - exclude_after)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }

    async fn targets_for_smart_recheck(&self) -> StoreResult<Vec<Target>> {
        sqlx::query(
            r#"SELECT t.* FROM targets t
               WHERE t.archived_at IS NULL
                 AND t.monitoring_state IN ('unresponsive', 'excluded')
                 AND (t.subnet_id IS NULL OR NOT EXISTS (
                     SELECT 1 FROM targets c
                     WHERE c.subnet_id = t.subnet_id AND c.archived_at IS NULL
                       AND c.ip_type = 'customer' AND c.monitoring_state = 'active'))"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::target)
        .collect()
    }
}

#[async_trait]
impl TierStore for PgStore {
    async fn upsert_tier(&self, tier: Tier) -> StoreResult<()> {
        tier.selection.validate()?;
        sqlx::query(
            r#"INSERT INTO tiers
               (name, probe_interval_secs, timeout_ms, retries, selection,
                default_expected_outcome)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (name) DO UPDATE SET
                 probe_interval_secs = EXCLUDED.probe_interval_secs,
                 timeout_ms = EXCLUDED.timeout_ms,
                 retries = EXCLUDED.retries,
                 selection = EXCLUDED.selection,
                 default_expected_outcome = EXCLUDED.default_expected_outcome"#,
        )
        .bind(&tier.name)
        .bind(tier.probe_interval_secs as i32)
        .bind(tier.timeout_ms as i32)
        .bind(tier.retries as i32)
        .bind(to_json(&tier.selection))
        .bind(tier.default_expected_outcome.as_ref().map(to_json))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_tier(&self, name: &str) -> StoreResult<Option<Tier>> {
        sqlx::query("SELECT * FROM tiers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::tier(&row))
            .transpose()
    }

    async fn list_tiers(&self) -> StoreResult<Vec<Tier>> {
        sqlx::query("SELECT * FROM tiers ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::tier)
            .collect()
    }

    async fn delete_tier(&self, name: &str) -> StoreResult<()> {
        let done = sqlx::query("DELETE FROM tiers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("tier"));
        }
        Ok(())
    }
}
