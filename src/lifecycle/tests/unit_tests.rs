//! # Lifecycle Unit Tests

use chrono::{Duration, Utc};
use sentinel_lifecycle::*;
use sentinel_store::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn setup() -> (Arc<MemoryStore>, LifecycleManager) {
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(store.clone(), LifecycleConfig::default());
    (store, manager)
}

fn subnet(cidr: &str) -> Subnet {
    let now = Utc::now();
    Subnet {
        id: Uuid::new_v4(),
        cidr: cidr.parse().unwrap(),
        source: "ipam".to_string(),
        subscriber: Some("acme".to_string()),
        service: None,
        location: None,
        pop: None,
        gateway_device: None,
        region: Some("ord".to_string()),
        vlan: None,
        service_status: SubnetServiceStatus::Active,
        service_status_changed_at: None,
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn target(ip: &str, subnet_id: Option<SubnetId>, state: MonitoringState) -> Target {
    let now = Utc::now();
    Target {
        id: Uuid::new_v4(),
        ip: ip.parse().unwrap(),
        tier: "default".to_string(),
        ownership: Ownership::Auto,
        origin: TargetOrigin::Sync,
        ip_type: IpType::Customer,
        monitoring_state: state,
        state_changed_at: now,
        subnet_id,
        is_representative: false,
        needs_review: false,
        first_response_at: None,
        last_response_at: None,
        baseline_established_at: None,
        expected_outcome: None,
        tags: HashMap::new(),
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn degraded_target_goes_down_then_excluded() {
    let (store, manager) = setup();
    let mut t = target("10.0.0.1", None, MonitoringState::Degraded);
    t.baseline_established_at = Some(Utc::now() - Duration::days(2));
    t.first_response_at = Some(Utc::now() - Duration::days(2));
    t.last_response_at = Some(Utc::now() - Duration::minutes(30));
    store.insert_target(t.clone()).await.unwrap();

    let moved = manager.run_transition_scan().await.unwrap();
    assert_eq!(moved, 1);
    let fetched = store.get_target(t.id).await.unwrap().unwrap();
    assert_eq!(fetched.monitoring_state, MonitoringState::Down);
    assert!(!fetched.needs_review);

    // Exclusion takes a week in the down state; not yet.
    let moved = manager.run_transition_scan().await.unwrap();
    assert_eq!(moved, 0);
}

#[tokio::test]
async fn silent_new_target_becomes_unresponsive() {
    let (store, manager) = setup();
    let mut t = target("10.0.0.1", None, MonitoringState::Unknown);
    t.created_at = Utc::now() - Duration::hours(3);
    store.insert_target(t.clone()).await.unwrap();

    manager.run_transition_scan().await.unwrap();
    let fetched = store.get_target(t.id).await.unwrap().unwrap();
    assert_eq!(fetched.monitoring_state, MonitoringState::Unresponsive);
}

#[tokio::test]
async fn resumed_responses_recover_target() {
    let (store, manager) = setup();
    let mut t = target("10.0.0.1", None, MonitoringState::Down);
    t.last_response_at = Some(Utc::now() - Duration::seconds(10));
    store.insert_target(t.clone()).await.unwrap();

    manager.run_transition_scan().await.unwrap();
    let fetched = store.get_target(t.id).await.unwrap().unwrap();
    assert_eq!(fetched.monitoring_state, MonitoringState::Active);
}

#[tokio::test]
async fn excluded_recovery_clears_review_flag() {
    let (store, manager) = setup();
    let mut t = target("10.0.0.1", None, MonitoringState::Excluded);
    t.needs_review = true;
    t.last_response_at = Some(Utc::now());
    store.insert_target(t.clone()).await.unwrap();

    manager.run_transition_scan().await.unwrap();
    let fetched = store.get_target(t.id).await.unwrap().unwrap();
    assert_eq!(fetched.monitoring_state, MonitoringState::Active);
    assert!(!fetched.needs_review);
}

#[tokio::test]
async fn invalid_transition_rejected() {
    let (store, manager) = setup();
    let t = target("10.0.0.1", None, MonitoringState::Active);
    store.insert_target(t.clone()).await.unwrap();

    let err = manager
        .transition(&t, MonitoringState::Excluded, "nope", "test")
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition(_, _)));
}

#[tokio::test]
async fn cancellation_cascade_spares_inactive_and_excluded() {
    let (store, manager) = setup();
    let s = subnet("10.1.0.0/24");
    store.upsert_subnet(s.clone()).await.unwrap();

    let active = target("10.1.0.1", Some(s.id), MonitoringState::Active);
    let down = target("10.1.0.2", Some(s.id), MonitoringState::Down);
    let excluded = target("10.1.0.3", Some(s.id), MonitoringState::Excluded);
    let inactive = target("10.1.0.4", Some(s.id), MonitoringState::Inactive);
    for t in [&active, &down, &excluded, &inactive] {
        store.insert_target(t.clone()).await.unwrap();
    }

    let moved = manager
        .on_subnet_service_change(&s, SubnetServiceStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(moved.len(), 2);

    for (id, expected) in [
        (active.id, MonitoringState::Inactive),
        (down.id, MonitoringState::Inactive),
        (excluded.id, MonitoringState::Excluded),
        (inactive.id, MonitoringState::Inactive),
    ] {
        assert_eq!(
            store.get_target(id).await.unwrap().unwrap().monitoring_state,
            expected
        );
    }

    // One history row for each moved target.
    assert_eq!(store.target_state_history(active.id, 10).await.unwrap().len(), 1);
    assert_eq!(store.target_state_history(excluded.id, 10).await.unwrap().len(), 0);

    let fetched = store.get_subnet(s.id).await.unwrap().unwrap();
    assert_eq!(fetched.service_status, SubnetServiceStatus::Cancelled);
    assert!(fetched.service_status_changed_at.is_some());
}

#[tokio::test]
async fn subnet_archival_splits_by_ownership() {
    let (store, manager) = setup();
    let s = subnet("10.1.0.0/24");
    store.upsert_subnet(s.clone()).await.unwrap();

    let auto = target("10.1.0.1", Some(s.id), MonitoringState::Active);
    let mut manual = target("10.1.0.2", Some(s.id), MonitoringState::Active);
    manual.ownership = Ownership::Manual;
    store.insert_target(auto.clone()).await.unwrap();
    store.insert_target(manual.clone()).await.unwrap();

    manager.on_subnet_archived(s.id).await.unwrap();

    let auto_after = store.get_target(auto.id).await.unwrap().unwrap();
    assert!(auto_after.archived_at.is_some());
    assert_eq!(auto_after.subnet_id, Some(s.id)); // kept for history

    let manual_after = store.get_target(manual.id).await.unwrap().unwrap();
    assert!(manual_after.archived_at.is_none());
    assert_eq!(manual_after.subnet_id, None); // orphaned
}

#[tokio::test]
async fn representative_promoted_from_oldest_standby() {
    let (store, manager) = setup();
    let s = subnet("10.1.0.0/24");
    store.upsert_subnet(s.clone()).await.unwrap();

    let mut rep = target("10.1.0.1", Some(s.id), MonitoringState::Down);
    rep.is_representative = true;
    rep.baseline_established_at = Some(Utc::now() - Duration::days(3));
    let mut older = target("10.1.0.2", Some(s.id), MonitoringState::Standby);
    older.baseline_established_at = Some(Utc::now() - Duration::days(9));
    let mut newer = target("10.1.0.3", Some(s.id), MonitoringState::Standby);
    newer.baseline_established_at = Some(Utc::now() - Duration::days(1));
    for t in [&rep, &older, &newer] {
        store.insert_target(t.clone()).await.unwrap();
    }

    let elected = manager.run_representative_election().await.unwrap();
    assert_eq!(elected, 1);

    let targets = store.list_targets_in_subnet(s.id).await.unwrap();
    let new_rep = targets.iter().find(|t| t.is_representative).unwrap();
    assert_eq!(new_rep.id, older.id);
    assert_eq!(new_rep.monitoring_state, MonitoringState::Active);

    // Exactly one representative among the subnet's customer targets.
    assert_eq!(targets.iter().filter(|t| t.is_representative).count(), 1);
}

#[tokio::test]
async fn healthy_incumbent_not_replaced() {
    let (store, manager) = setup();
    let s = subnet("10.1.0.0/24");
    store.upsert_subnet(s.clone()).await.unwrap();

    let mut rep = target("10.1.0.1", Some(s.id), MonitoringState::Active);
    rep.is_representative = true;
    rep.baseline_established_at = Some(Utc::now() - Duration::days(3));
    let mut standby = target("10.1.0.2", Some(s.id), MonitoringState::Standby);
    standby.baseline_established_at = Some(Utc::now() - Duration::days(9));
    store.insert_target(rep.clone()).await.unwrap();
    store.insert_target(standby).await.unwrap();

    let elected = manager.run_representative_election().await.unwrap();
    assert_eq!(elected, 0);
    let targets = store.list_targets_in_subnet(s.id).await.unwrap();
    assert!(targets.iter().find(|t| t.id == rep.id).unwrap().is_representative);
}

#[tokio::test]
async fn mark_inactive_and_acknowledge_review() {
    let (store, manager) = setup();
    let mut t = target("10.0.0.1", None, MonitoringState::Excluded);
    t.needs_review = true;
    store.insert_target(t.clone()).await.unwrap();

    manager.acknowledge_review(t.id).await.unwrap();
    assert!(!store.get_target(t.id).await.unwrap().unwrap().needs_review);
    // Idempotent.
    manager.acknowledge_review(t.id).await.unwrap();

    manager.mark_inactive(t.id, "user:42").await.unwrap();
    let fetched = store.get_target(t.id).await.unwrap().unwrap();
    assert_eq!(fetched.monitoring_state, MonitoringState::Inactive);

    let history = store.target_state_history(t.id, 10).await.unwrap();
    assert_eq!(history[0].triggered_by, "user:42");
}
