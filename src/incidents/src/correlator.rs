//! # Incident Correlator
//!
//! Groups concurrent unlinked alerts by correlation key into incidents:
//! link into an existing active incident when one exists, otherwise open a
//! new one once the key's minimum cardinality is met. Incidents confirm
//! (pending → active) after a severity-sized wait and accumulate peaks
//! monotonically.

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sentinel_store::{
    Alert, AlertEvent, AlertEventType, AlertSeverity, AlertStore, Incident, IncidentId,
    IncidentStatus, IncidentStore, Store,
};

use crate::types::{
    classify, confirmation_wait, min_cardinality, CorrelatorTickSummary, IncidentConfig,
    IncidentError,
};

const WORKER: &str = "incident_correlator";

pub struct IncidentCorrelator {
    store: Arc<dyn Store>,
    config: IncidentConfig,
}

impl IncidentCorrelator {
    pub fn new(store: Arc<dyn Store>, config: IncidentConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IncidentConfig {
        &self.config
    }

    pub async fn run_tick(&self) -> Result<CorrelatorTickSummary, IncidentError> {
        let now = Utc::now();
        let mut summary = CorrelatorTickSummary::default();

        let window_start = now - Duration::seconds(self.config.window_secs);
        let unlinked = self.store.unlinked_active_alerts(window_start).await?;
        let mut by_key: HashMap<String, Vec<Alert>> = HashMap::new();
        for alert in unlinked {
            by_key.entry(alert.correlation_key.clone()).or_default().push(alert);
        }

        for (key, alerts) in by_key {
            match self.store.find_active_incident_by_correlation(&key).await? {
                Some(incident) => {
                    summary.alerts_linked += self.link_into(&incident, &alerts).await?;
                }
                None => {
                    if alerts.len() >= min_cardinality(&key) {
                        self.open_incident(&key, alerts, &mut summary).await?;
                    }
                }
            }
        }

        summary.incidents_confirmed = self.confirm_pending(now).await?;
        debug!(
            created = summary.incidents_created,
            linked = summary.alerts_linked,
            confirmed = summary.incidents_confirmed,
            "correlator tick complete"
        );
        Ok(summary)
    }

    async fn open_incident(
        &self,
        key: &str,
        alerts: Vec<Alert>,
        summary: &mut CorrelatorTickSummary,
    ) -> Result<(), IncidentError> {
        let now = Utc::now();
        let severity = alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or(AlertSeverity::Warning);
        let target_ids: Vec<_> = dedup(alerts.iter().map(|a| a.target_id));
        let agent_ids: Vec<_> = dedup(alerts.iter().filter_map(|a| a.agent_id));
        let incident_type = classify(key, agent_ids.len(), self.config.global_agent_threshold);

        let incident_id: IncidentId = Uuid::new_v4();
        // Critical bursts page immediately; lower severities wait out the
        // confirmation delay as pending.
        let (status, confirmed_at) = if confirmation_wait(severity).is_zero() {
            (IncidentStatus::Active, Some(now))
        } else {
            (IncidentStatus::Pending, None)
        };

        let incident = Incident {
            id: incident_id,
            correlation_key: key.to_string(),
            incident_type,
            severity,
            status,
            affected_target_ids: target_ids,
            affected_agent_ids: agent_ids,
            alert_count: alerts.len() as u32,
            peak_alert_count: alerts.len() as u32,
            peak_severity: severity,
            detected_at: now,
            confirmed_at,
            acknowledged_at: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };

        let links: Vec<_> = alerts
            .iter()
            .map(|alert| {
                let mut event = AlertEvent::new(
                    alert.id,
                    AlertEventType::LinkedToIncident,
                    format!("linked to incident {incident_id}"),
                    WORKER,
                    now,
                );
                event.metrics = Some(alert.metrics);
                (alert.id, event)
            })
            .collect();

        self.store.create_incident_with_alerts(incident, links).await?;
        summary.incidents_created += 1;
        summary.alerts_linked += alerts.len();
        info!(key, incident = %incident_id, alerts = alerts.len(), "incident opened");
        Ok(())
    }

    /// Link newly-correlated alerts into an existing active incident and
    /// roll its membership and peaks forward.
    async fn link_into(
        &self,
        incident: &Incident,
        alerts: &[Alert],
    ) -> Result<usize, IncidentError> {
        let now = Utc::now();
        let mut linked = 0;
        let mut updated = incident.clone();

        for alert in alerts {
            let event = AlertEvent::new(
                alert.id,
                AlertEventType::LinkedToIncident,
                format!("linked to incident {}", incident.id),
                WORKER,
                now,
            );
            self.store
                .link_alert_to_incident(alert.id, incident.id, event)
                .await?;
            linked += 1;

            if !updated.affected_target_ids.contains(&alert.target_id) {
                updated.affected_target_ids.push(alert.target_id);
            }
            if let Some(agent_id) = alert.agent_id {
                if !updated.affected_agent_ids.contains(&agent_id) {
                    updated.affected_agent_ids.push(agent_id);
                }
            }
            updated.severity = updated.severity.max(alert.severity);
            updated.peak_severity = updated.peak_severity.max(alert.severity);
        }

        if linked > 0 {
            updated.alert_count += linked as u32;
            updated.peak_alert_count = updated.peak_alert_count.max(updated.alert_count);
            updated.updated_at = now;
            self.store.update_incident(&updated).await?;
        }
        Ok(linked)
    }

    /// Flip pending incidents to active once their confirmation wait has
    /// elapsed.
    async fn confirm_pending(&self, now: chrono::DateTime<Utc>) -> Result<usize, IncidentError> {
        let mut confirmed = 0;
        for mut incident in self
            .store
            .list_incidents_with_status(&[IncidentStatus::Pending])
            .await?
        {
            if now - incident.detected_at >= confirmation_wait(incident.severity) {
                incident.status = IncidentStatus::Active;
                incident.confirmed_at = Some(now);
                incident.updated_at = now;
                self.store.update_incident(&incident).await?;
                confirmed += 1;
            }
        }
        Ok(confirmed)
    }

    /// Operator action; acknowledging an acknowledged incident is a no-op.
    pub async fn acknowledge(&self, incident_id: IncidentId) -> Result<Incident, IncidentError> {
        let mut incident = self
            .store
            .get_incident(incident_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("incident"))?;
        if incident.status == IncidentStatus::Acknowledged {
            return Ok(incident);
        }
        if incident.status == IncidentStatus::Resolved {
            return Err(IncidentError::Store(sentinel_store::StoreError::Conflict(
                "cannot acknowledge a resolved incident".to_string(),
            )));
        }
        let now = Utc::now();
        incident.status = IncidentStatus::Acknowledged;
        incident.acknowledged_at = Some(now);
        incident.updated_at = now;
        self.store.update_incident(&incident).await?;
        Ok(incident)
    }

    /// Operator action; terminal. A new correlated burst under the same
    /// key creates a fresh incident.
    pub async fn resolve(&self, incident_id: IncidentId) -> Result<Incident, IncidentError> {
        let mut incident = self
            .store
            .get_incident(incident_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("incident"))?;
        if incident.status == IncidentStatus::Resolved {
            return Ok(incident);
        }
        let now = Utc::now();
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now);
        incident.updated_at = now;
        self.store.update_incident(&incident).await?;
        Ok(incident)
    }
}

fn dedup<T: std::hash::Hash + Eq + Copy>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(*item)).collect()
}

/// Periodic correlator loop.
pub async fn run_incident_worker(
    correlator: Arc<IncidentCorrelator>,
    token: CancellationToken,
) -> Result<(), IncidentError> {
    let mut tick = interval(StdDuration::from_secs(correlator.config().tick_secs));
    info!(
        tick_secs = correlator.config().tick_secs,
        "incident correlator started"
    );
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = correlator.run_tick().await {
            warn!(error = %e, "correlator tick failed");
        }
    }
    info!("incident correlator stopped");
    Ok(())
}
