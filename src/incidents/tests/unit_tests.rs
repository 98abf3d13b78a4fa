//! # Incident Correlator Tests

use chrono::{Duration, Utc};
use sentinel_incidents::*;
use sentinel_store::*;
use std::sync::Arc;
use uuid::Uuid;

fn alert(correlation_key: &str, severity: AlertSeverity, agent: Option<AgentId>) -> Alert {
    let now = Utc::now();
    Alert {
        id: Uuid::new_v4(),
        target_id: Uuid::new_v4(),
        agent_id: agent,
        alert_type: AlertType::TargetDown,
        severity,
        initial_severity: severity,
        peak_severity: severity,
        status: AlertStatus::Active,
        metrics: AlertMetrics::default(),
        initial_metrics: AlertMetrics::default(),
        peak_metrics: AlertMetrics::default(),
        detected_at: now,
        last_updated_at: now,
        resolved_at: None,
        acknowledged_at: None,
        correlation_key: correlation_key.to_string(),
        incident_id: None,
        enrichment: AlertEnrichment::default(),
        last_escalated_at: None,
    }
}

async fn seed_alerts(store: &MemoryStore, alerts: &[Alert]) {
    for a in alerts {
        let event = AlertEvent::new(a.id, AlertEventType::Created, "", "alert_worker", a.detected_at);
        store.create_alert(a.clone(), event).await.unwrap();
    }
}

#[tokio::test]
async fn subnet_burst_creates_regional_incident() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let agents: Vec<AgentId> = (0..2).map(|_| Uuid::new_v4()).collect();

    // Ten concurrent alerts under the subnet key from two agents.
    let alerts: Vec<Alert> = (0..10)
        .map(|i| alert(&subnet_key, AlertSeverity::Critical, Some(agents[i % 2])))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    let summary = correlator.run_tick().await.unwrap();
    assert_eq!(summary.incidents_created, 1);
    assert_eq!(summary.alerts_linked, 10);

    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.incident_type, IncidentType::Regional);
    assert_eq!(incident.affected_target_ids.len(), 10);
    assert_eq!(incident.affected_agent_ids.len(), 2);
    assert_eq!(incident.severity, AlertSeverity::Critical);
    // Critical bursts confirm immediately.
    assert_eq!(incident.status, IncidentStatus::Active);
    assert!(incident.confirmed_at.is_some());

    // Every member got its linked_to_incident event.
    for a in &alerts {
        let linked = store.get_alert(a.id).await.unwrap().unwrap();
        assert_eq!(linked.incident_id, Some(incident.id));
        let events = store.alert_events(a.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == AlertEventType::LinkedToIncident));
    }
}

#[tokio::test]
async fn below_cardinality_no_incident() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..2)
        .map(|_| alert(&subnet_key, AlertSeverity::Warning, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    let summary = correlator.run_tick().await.unwrap();
    assert_eq!(summary.incidents_created, 0);
    assert!(store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn late_alert_links_into_existing_incident() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..3)
        .map(|_| alert(&subnet_key, AlertSeverity::Warning, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    correlator.run_tick().await.unwrap();
    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.alert_count, 3);

    // A straggler under the same key joins the open incident and can
    // escalate its severity rollup.
    let late = alert(&subnet_key, AlertSeverity::Critical, Some(Uuid::new_v4()));
    seed_alerts(&store, std::slice::from_ref(&late)).await;
    let summary = correlator.run_tick().await.unwrap();
    assert_eq!(summary.incidents_created, 0);
    assert_eq!(summary.alerts_linked, 1);

    let updated = store.get_incident(incident.id).await.unwrap().unwrap();
    assert_eq!(updated.alert_count, 4);
    assert_eq!(updated.peak_alert_count, 4);
    assert_eq!(updated.severity, AlertSeverity::Critical);
    assert_eq!(updated.affected_target_ids.len(), 4);
}

#[tokio::test]
async fn warning_incident_waits_for_confirmation() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..3)
        .map(|_| alert(&subnet_key, AlertSeverity::Warning, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    correlator.run_tick().await.unwrap();

    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.status, IncidentStatus::Pending);
    assert!(incident.confirmed_at.is_none());

    // Backdate detection past the 30s warning wait; the next tick confirms.
    let mut aged = incident.clone();
    aged.detected_at = Utc::now() - Duration::seconds(31);
    store.update_incident(&aged).await.unwrap();

    let summary = correlator.run_tick().await.unwrap();
    assert_eq!(summary.incidents_confirmed, 1);
    let confirmed = store.get_incident(incident.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, IncidentStatus::Active);
    assert!(confirmed.confirmed_at.is_some());
}

#[tokio::test]
async fn resolved_incident_never_gains_links() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..3)
        .map(|_| alert(&subnet_key, AlertSeverity::Critical, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    correlator.run_tick().await.unwrap();
    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();

    correlator.resolve(incident.id).await.unwrap();
    // Terminal and idempotent.
    correlator.resolve(incident.id).await.unwrap();

    // A new burst under the same key creates a NEW incident.
    let fresh: Vec<Alert> = (0..3)
        .map(|_| alert(&subnet_key, AlertSeverity::Critical, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &fresh).await;
    let summary = correlator.run_tick().await.unwrap();
    assert_eq!(summary.incidents_created, 1);

    let second = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(second.id, incident.id);
}

#[tokio::test]
async fn acknowledge_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..3)
        .map(|_| alert(&subnet_key, AlertSeverity::Critical, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    correlator.run_tick().await.unwrap();
    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();

    let acked = correlator.acknowledge(incident.id).await.unwrap();
    assert_eq!(acked.status, IncidentStatus::Acknowledged);
    // Idempotent.
    correlator.acknowledge(incident.id).await.unwrap();

    correlator.resolve(incident.id).await.unwrap();
    assert!(matches!(
        correlator.acknowledge(incident.id).await,
        Err(IncidentError::Store(StoreError::Conflict(_)))
    ));
}

#[tokio::test]
async fn wide_agent_spread_classifies_global() {
    let store = Arc::new(MemoryStore::new());
    let subnet_key = format!("subnet:{}", Uuid::new_v4());
    let alerts: Vec<Alert> = (0..12)
        .map(|_| alert(&subnet_key, AlertSeverity::Critical, Some(Uuid::new_v4())))
        .collect();
    seed_alerts(&store, &alerts).await;

    let correlator = IncidentCorrelator::new(store.clone(), IncidentConfig::default());
    correlator.run_tick().await.unwrap();

    let incident = store
        .find_active_incident_by_correlation(&subnet_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.incident_type, IncidentType::Global);
}
