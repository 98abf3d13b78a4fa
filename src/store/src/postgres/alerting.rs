//! Alert, incident, activity-log and alert-config persistence. Every alert
//! mutation commits its head row together with its event row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use super::rows;
use super::{enum_str, from_json, map_sqlx, to_json, PgStore};
use crate::store::{ActivityStore, AlertConfigStore, AlertStore, IncidentStore};
use crate::types::*;

fn bind_alert_event<'q>(
    query: Query<'q, Postgres, PgArguments>,
    event: &'q AlertEvent,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(event.id)
        .bind(event.alert_id)
        .bind(enum_str(&event.event_type))
        .bind(event.old_severity.as_ref().map(enum_str))
        .bind(event.new_severity.as_ref().map(enum_str))
        .bind(event.old_status.as_ref().map(enum_str))
        .bind(event.new_status.as_ref().map(enum_str))
        .bind(event.metrics.as_ref().map(to_json))
        .bind(&event.description)
        .bind(&event.triggered_by)
        .bind(event.created_at)
}

const INSERT_EVENT: &str = r#"INSERT INTO alert_events
    (id, alert_id, event_type, old_severity, new_severity, old_status,
     new_status, metrics, description, triggered_by, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#;

#[async_trait]
impl AlertStore for PgStore {
    async fn create_alert(&self, alert: Alert, event: AlertEvent) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            r#"INSERT INTO alerts
               (id, target_id, agent_id, alert_type, severity, initial_severity,
                peak_severity, status, metrics, initial_metrics, peak_metrics,
                detected_at, last_updated_at, resolved_at, acknowledged_at,
                correlation_key, incident_id, enrichment, last_escalated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18, $19)"#,
        )
        .bind(alert.id)
        .bind(alert.target_id)
        .bind(alert.agent_id)
        .bind(enum_str(&alert.alert_type))
        .bind(enum_str(&alert.severity))
        .bind(enum_str(&alert.initial_severity))
        .bind(enum_str(&alert.peak_severity))
        .bind(enum_str(&alert.status))
        .bind(to_json(&alert.metrics))
        .bind(to_json(&alert.initial_metrics))
        .bind(to_json(&alert.peak_metrics))
        .bind(alert.detected_at)
        .bind(alert.last_updated_at)
        .bind(alert.resolved_at)
        .bind(alert.acknowledged_at)
        .bind(&alert.correlation_key)
        .bind(alert.incident_id)
        .bind(to_json(&alert.enrichment))
        .bind(alert.last_escalated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        bind_alert_event(sqlx::query(INSERT_EVENT), &event)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert, event: Option<AlertEvent>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let done = sqlx::query(
            r#"UPDATE alerts SET
                 severity = $2, peak_severity = $3, status = $4, metrics = $5,
                 peak_metrics = $6, last_updated_at = $7, resolved_at = $8,
                 acknowledged_at = $9, incident_id = $10, last_escalated_at = $11
               WHERE id = $1"#,
        )
        .bind(alert.id)
        .bind(enum_str(&alert.severity))
        .bind(enum_str(&alert.peak_severity))
        .bind(enum_str(&alert.status))
        .bind(to_json(&alert.metrics))
        .bind(to_json(&alert.peak_metrics))
        .bind(alert.last_updated_at)
        .bind(alert.resolved_at)
        .bind(alert.acknowledged_at)
        .bind(alert.incident_id)
        .bind(alert.last_escalated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("alert"));
        }
        if let Some(event) = &event {
            bind_alert_event(sqlx::query(INSERT_EVENT), event)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        sqlx::query("SELECT * FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::alert(&row))
            .transpose()
    }

    async fn list_alerts_with_status(&self, statuses: &[AlertStatus]) -> StoreResult<Vec<Alert>> {
        let names: Vec<String> = statuses.iter().map(enum_str).collect();
        sqlx::query("SELECT * FROM alerts WHERE status = ANY($1) ORDER BY detected_at DESC")
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::alert)
            .collect()
    }

    async fn find_active_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
    ) -> StoreResult<Option<Alert>> {
        sqlx::query(
            r#"SELECT * FROM alerts
               WHERE target_id = $1 AND alert_type = $2
                 AND agent_id IS NOT DISTINCT FROM $3
                 AND status <> 'resolved'
               LIMIT 1"#,
        )
        .bind(target_id)
        .bind(enum_str(&alert_type))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|row| rows::alert(&row))
        .transpose()
    }

    async fn find_recently_resolved_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
        resolved_after: DateTime<Utc>,
    ) -> StoreResult<Option<Alert>> {
        sqlx::query(
            r#"SELECT * FROM alerts
               WHERE target_id = $1 AND alert_type = $2
                 AND agent_id IS NOT DISTINCT FROM $3
                 AND status = 'resolved' AND resolved_at >= $4
               ORDER BY resolved_at DESC
               LIMIT 1"#,
        )
        .bind(target_id)
        .bind(enum_str(&alert_type))
        .bind(agent_id)
        .bind(resolved_after)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|row| rows::alert(&row))
        .transpose()
    }

    async fn unlinked_active_alerts(&self, since: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
        sqlx::query(
            r#"SELECT * FROM alerts
               WHERE status IN ('active', 'acknowledged')
                 AND incident_id IS NULL AND last_updated_at >= $1"#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::alert)
        .collect()
    }

    async fn targets_with_active_alerts(&self) -> StoreResult<Vec<TargetId>> {
        let ids: Vec<(TargetId,)> = sqlx::query_as(
            "SELECT DISTINCT target_id FROM alerts WHERE status IN ('active', 'acknowledged')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn alerts_for_target(
        &self,
        target_id: TargetId,
        statuses: &[AlertStatus],
    ) -> StoreResult<Vec<Alert>> {
        let names: Vec<String> = statuses.iter().map(enum_str).collect();
        sqlx::query("SELECT * FROM alerts WHERE target_id = $1 AND status = ANY($2)")
            .bind(target_id)
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::alert)
            .collect()
    }

    async fn alert_events(&self, alert_id: AlertId) -> StoreResult<Vec<AlertEvent>> {
        sqlx::query("SELECT * FROM alert_events WHERE alert_id = $1 ORDER BY created_at, id")
            .bind(alert_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::alert_event)
            .collect()
    }

    async fn link_alert_to_incident(
        &self,
        alert_id: AlertId,
        incident_id: IncidentId,
        event: AlertEvent,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let done = sqlx::query(
            "UPDATE alerts SET incident_id = $2 WHERE id = $1 AND status <> 'resolved'",
        )
        .bind(alert_id)
        .bind(incident_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            let exists: Option<(AlertId,)> =
                sqlx::query_as("SELECT id FROM alerts WHERE id = $1")
                    .bind(alert_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
            return Err(match exists {
                None => StoreError::NotFound("alert"),
                Some(_) => StoreError::Conflict("cannot link a resolved alert".to_string()),
            });
        }
        bind_alert_event(sqlx::query(INSERT_EVENT), &event)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl IncidentStore for PgStore {
    async fn create_incident_with_alerts(
        &self,
        incident: Incident,
        links: Vec<(AlertId, AlertEvent)>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(
            r#"INSERT INTO incidents
               (id, correlation_key, incident_type, severity, status,
                affected_target_ids, affected_agent_ids, alert_count,
                peak_alert_count, peak_severity, detected_at, confirmed_at,
                acknowledged_at, resolved_at, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16)"#,
        )
        .bind(incident.id)
        .bind(&incident.correlation_key)
        .bind(enum_str(&incident.incident_type))
        .bind(enum_str(&incident.severity))
        .bind(enum_str(&incident.status))
        .bind(to_json(&incident.affected_target_ids))
        .bind(to_json(&incident.affected_agent_ids))
        .bind(incident.alert_count as i32)
        .bind(incident.peak_alert_count as i32)
        .bind(enum_str(&incident.peak_severity))
        .bind(incident.detected_at)
        .bind(incident.confirmed_at)
        .bind(incident.acknowledged_at)
        .bind(incident.resolved_at)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for (alert_id, event) in &links {
            let done = sqlx::query(
                "UPDATE alerts SET incident_id = $2 WHERE id = $1 AND status <> 'resolved'",
            )
            .bind(alert_id)
            .bind(incident.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            if done.rows_affected() == 0 {
                return Err(StoreError::Conflict(
                    "cannot link a resolved alert".to_string(),
                ));
            }
            bind_alert_event(sqlx::query(INSERT_EVENT), event)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> StoreResult<Option<Incident>> {
        sqlx::query("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(|row| rows::incident(&row))
            .transpose()
    }

    async fn list_incidents_with_status(
        &self,
        statuses: &[IncidentStatus],
    ) -> StoreResult<Vec<Incident>> {
        let names: Vec<String> = statuses.iter().map(enum_str).collect();
        sqlx::query("SELECT * FROM incidents WHERE status = ANY($1) ORDER BY detected_at DESC")
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(rows::incident)
            .collect()
    }

    async fn find_active_incident_by_correlation(
        &self,
        correlation_key: &str,
    ) -> StoreResult<Option<Incident>> {
        sqlx::query(
            r#"SELECT * FROM incidents
               WHERE correlation_key = $1 AND status <> 'resolved'
               ORDER BY detected_at DESC LIMIT 1"#,
        )
        .bind(correlation_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|row| rows::incident(&row))
        .transpose()
    }

    async fn update_incident(&self, incident: &Incident) -> StoreResult<()> {
        let done = sqlx::query(
            r#"UPDATE incidents SET
                 severity = $2, status = $3, affected_target_ids = $4,
                 affected_agent_ids = $5, alert_count = $6, peak_alert_count = $7,
                 peak_severity = $8, confirmed_at = $9, acknowledged_at = $10,
                 resolved_at = $11, updated_at = $12
               WHERE id = $1"#,
        )
        .bind(incident.id)
        .bind(enum_str(&incident.severity))
        .bind(enum_str(&incident.status))
        .bind(to_json(&incident.affected_target_ids))
        .bind(to_json(&incident.affected_agent_ids))
        .bind(incident.alert_count as i32)
        .bind(incident.peak_alert_count as i32)
        .bind(enum_str(&incident.peak_severity))
        .bind(incident.confirmed_at)
        .bind(incident.acknowledged_at)
        .bind(incident.resolved_at)
        .bind(incident.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound("incident"));
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn append_activity(&self, entry: ActivityEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO activity_log
               (id, target_id, subnet_id, agent_id, ip, category, event_type,
                details, triggered_by, severity, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(entry.id)
        .bind(entry.target_id)
        .bind(entry.subnet_id)
        .bind(entry.agent_id)
        .bind(entry.ip.map(|ip| ip.to_string()))
        .bind(enum_str(&entry.category))
        .bind(&entry.event_type)
        .bind(&entry.details)
        .bind(&entry.triggered_by)
        .bind(enum_str(&entry.severity))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_activity(&self, filter: &ActivityFilter) -> StoreResult<Vec<ActivityEntry>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        sqlx::query(
            r#"SELECT * FROM activity_log
               WHERE ($1::uuid IS NULL OR agent_id = $1)
                 AND ($2::uuid IS NULL OR target_id = $2)
                 AND ($3::uuid IS NULL OR subnet_id = $3)
                 AND ($4::text IS NULL OR ip = $4)
                 AND ($5::text IS NULL OR category = $5)
                 AND ($6::timestamptz IS NULL OR created_at >= $6)
               ORDER BY created_at DESC
               LIMIT $7"#,
        )
        .bind(filter.agent_id)
        .bind(filter.target_id)
        .bind(filter.subnet_id)
        .bind(filter.ip.map(|ip| ip.to_string()))
        .bind(filter.category.as_ref().map(enum_str))
        .bind(filter.since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(rows::activity_entry)
        .collect()
    }

    async fn prune_activity(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let done = sqlx::query("DELETE FROM activity_log WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl AlertConfigStore for PgStore {
    async fn get_alert_config(&self) -> StoreResult<AlertConfig> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT config FROM alert_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
        match row {
            Some((value,)) => from_json(value),
            None => Ok(AlertConfig::default()),
        }
    }

    async fn put_alert_config(&self, config: AlertConfig) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO alert_config (id, config) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE SET config = EXCLUDED.config"#,
        )
        .bind(to_json(&config))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}
