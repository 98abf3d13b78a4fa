//! # Store Unit Tests
//!
//! Behavioral tests for the in-memory backend, which defines the
//! transactional contract both backends must honor.

use chrono::{Duration, Utc};
use sentinel_store::*;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

fn agent(name: &str, region: &str) -> Agent {
    let now = Utc::now();
    Agent {
        id: Uuid::new_v4(),
        name: name.to_string(),
        region: region.to_string(),
        provider: "colo".to_string(),
        location: String::new(),
        public_ip: None,
        capabilities: vec![ProbeKind::Icmp],
        max_targets: 10_000,
        version: "1.0.0".to_string(),
        tags: HashMap::new(),
        api_key_hash: None,
        last_heartbeat: None,
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn subnet(cidr: &str, region: &str) -> Subnet {
    let now = Utc::now();
    Subnet {
        id: Uuid::new_v4(),
        cidr: cidr.parse().unwrap(),
        source: "ipam".to_string(),
        subscriber: Some("acme".to_string()),
        service: None,
        location: None,
        pop: Some("pop-1".to_string()),
        gateway_device: None,
        region: Some(region.to_string()),
        vlan: None,
        service_status: SubnetServiceStatus::Active,
        service_status_changed_at: None,
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn target(ip: &str, subnet_id: Option<SubnetId>) -> Target {
    let now = Utc::now();
    Target {
        id: Uuid::new_v4(),
        ip: ip.parse().unwrap(),
        tier: "default".to_string(),
        ownership: Ownership::Auto,
        origin: TargetOrigin::Sync,
        ip_type: IpType::Customer,
        monitoring_state: MonitoringState::Active,
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

fn result_at(agent_id: AgentId, target_id: TargetId, offset_secs: i64) -> ProbeResult {
    ProbeResult {
        time: Utc::now() - Duration::seconds(offset_secs),
        target_id,
        agent_id,
        success: true,
        error: None,
        latency_ms: Some(10.0),
        packet_loss_pct: Some(0.0),
        payload: None,
        agent_region: None,
        target_region: None,
        is_in_market: false,
    }
}

#[tokio::test]
async fn result_insert_enriches_and_dedups() {
    let store = MemoryStore::new();
    let a1 = agent("probe-ord", "ord");
    let s1 = subnet("10.1.0.0/24", "ord");
    let s2 = subnet("10.2.0.0/24", "nyc");
    let t1 = target("10.1.0.5", Some(s1.id));
    let t2 = target("10.2.0.5", Some(s2.id));
    store.insert_agent(a1.clone()).await.unwrap();
    store.upsert_subnet(s1).await.unwrap();
    store.upsert_subnet(s2).await.unwrap();
    store.insert_target(t1.clone()).await.unwrap();
    store.insert_target(t2.clone()).await.unwrap();

    let r1 = result_at(a1.id, t1.id, 10);
    let r2 = result_at(a1.id, t2.id, 10);
    let inserted = store
        .bulk_insert_results(vec![r1.clone(), r2.clone()])
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    // Same batch again: fully absorbed by the (time, target, agent) key.
    let inserted = store.bulk_insert_results(vec![r1, r2]).await.unwrap();
    assert_eq!(inserted, 0);

    let pairs = store
        .active_pairs_since(Utc::now() - Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(pairs.len(), 2);

    let stats = store
        .bulk_pair_window_stats(&pairs, Utc::now() - Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);

    let query = MetricsQuery {
        agent_filter: AgentFilter::default(),
        target_filter: TargetFilter {
            ids: vec![t1.id],
            ..TargetFilter::default()
        },
        range: TimeRange::Window("1h".to_string()),
        bucket: None,
        metrics: vec![Metric::ProbeCount],
        group_by: vec![GroupBy::Time, GroupBy::TargetRegion],
    };
    let rows = store.metrics_query(&query).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dimensions["target_region"], "ord");
}

#[tokio::test]
async fn in_market_flag_matches_regions() {
    let store = MemoryStore::new();
    let a1 = agent("probe-ord", "ord");
    let s_ord = subnet("10.1.0.0/24", "ord");
    let s_nyc = subnet("10.2.0.0/24", "nyc");
    let t_ord = target("10.1.0.5", Some(s_ord.id));
    let t_nyc = target("10.2.0.5", Some(s_nyc.id));
    store.insert_agent(a1.clone()).await.unwrap();
    store.upsert_subnet(s_ord).await.unwrap();
    store.upsert_subnet(s_nyc).await.unwrap();
    store.insert_target(t_ord.clone()).await.unwrap();
    store.insert_target(t_nyc.clone()).await.unwrap();

    store
        .bulk_insert_results(vec![
            result_at(a1.id, t_ord.id, 5),
            result_at(a1.id, t_nyc.id, 5),
        ])
        .await
        .unwrap();

    let q = MetricsQuery {
        agent_filter: AgentFilter::default(),
        target_filter: TargetFilter::default(),
        range: TimeRange::Window("1h".to_string()),
        bucket: None,
        metrics: vec![Metric::ProbeCount],
        group_by: vec![GroupBy::TargetRegion],
    };
    let rows = store.metrics_query(&q).await.unwrap();
    let regions: Vec<&str> = rows
        .iter()
        .map(|r| r.dimensions["target_region"].as_str())
        .collect();
    assert!(regions.contains(&"ord"));
    assert!(regions.contains(&"nyc"));
}

#[tokio::test]
async fn assignment_version_monotonic_and_journaled() {
    let store = MemoryStore::new();
    let a = agent("probe-1", "ord");
    let t = target("10.0.0.1", None);

    assert_eq!(store.current_assignment_version().await.unwrap(), 0);

    let diff = AssignmentDiff {
        added: vec![Assignment {
            target_id: t.id,
            agent_id: a.id,
            tier: "default".to_string(),
        }],
        removed: vec![],
    };
    let v1 = store.apply_assignment_diff(diff).await.unwrap();
    assert_eq!(v1, 1);

    let diff = AssignmentDiff {
        added: vec![],
        removed: vec![(t.id, a.id)],
    };
    let v2 = store.apply_assignment_diff(diff).await.unwrap();
    assert_eq!(v2, 2);

    // Empty diffs are the caller's bug, not a silent version bump.
    assert!(store
        .apply_assignment_diff(AssignmentDiff::default())
        .await
        .is_err());
    assert_eq!(store.current_assignment_version().await.unwrap(), 2);

    let changes = store.assignment_changes_since(a.id, 0).await.unwrap().unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].op, AssignmentOp::Add);
    assert_eq!(changes[1].op, AssignmentOp::Remove);

    let changes = store.assignment_changes_since(a.id, 2).await.unwrap().unwrap();
    assert!(changes.is_empty());
}

#[tokio::test]
async fn heartbeat_is_forward_only_and_ignores_archived() {
    let store = MemoryStore::new();
    let a = agent("probe-1", "ord");
    store.insert_agent(a.clone()).await.unwrap();

    let now = Utc::now();
    let metrics = |at| AgentMetricsRow {
        time: at,
        agent_id: a.id,
        cpu_pct: 0.0,
        memory_pct: 0.0,
        tasks: 0,
        active_targets: 0,
        probes_per_second: 0.0,
        results_queued: 0,
        results_shipped: 0,
        assignment_version: 0,
    };

    assert!(store.record_heartbeat(a.id, now, metrics(now)).await.unwrap());
    // A stale replay cannot regress the freshness timestamp.
    let stale = now - Duration::seconds(30);
    store.record_heartbeat(a.id, stale, metrics(stale)).await.unwrap();
    let fetched = store.get_agent(a.id).await.unwrap().unwrap();
    assert_eq!(fetched.last_heartbeat, Some(now));

    store.set_agent_archived(a.id, Some(now)).await.unwrap();
    let accepted = store
        .record_heartbeat(a.id, now + Duration::seconds(5), metrics(now))
        .await
        .unwrap();
    assert!(!accepted);
}

#[tokio::test]
async fn update_agent_preserves_heartbeat() {
    let store = MemoryStore::new();
    let mut a = agent("probe-1", "ord");
    store.insert_agent(a.clone()).await.unwrap();
    let hb = Utc::now();
    store
        .record_heartbeat(
            a.id,
            hb,
            AgentMetricsRow {
                time: hb,
                agent_id: a.id,
                cpu_pct: 0.0,
                memory_pct: 0.0,
                tasks: 0,
                active_targets: 0,
                probes_per_second: 0.0,
                results_queued: 0,
                results_shipped: 0,
                assignment_version: 0,
            },
        )
        .await
        .unwrap();

    a.location = "chicago".to_string();
    a.last_heartbeat = None; // stale caller copy must not clobber the row
    store.update_agent(a.clone()).await.unwrap();
    let fetched = store.get_agent(a.id).await.unwrap().unwrap();
    assert_eq!(fetched.location, "chicago");
    assert_eq!(fetched.last_heartbeat, Some(hb));
}

#[tokio::test]
async fn overlapping_subnets_of_same_source_rejected() {
    let store = MemoryStore::new();
    store.upsert_subnet(subnet("10.1.0.0/24", "ord")).await.unwrap();
    let err = store
        .upsert_subnet(subnet("10.1.0.0/25", "ord"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // A different source may carve the same space.
    let mut other = subnet("10.1.0.0/25", "ord");
    other.source = "manual".to_string();
    store.upsert_subnet(other).await.unwrap();
}

#[tokio::test]
async fn duplicate_active_target_ip_rejected() {
    let store = MemoryStore::new();
    let t = target("10.0.0.1", None);
    store.insert_target(t.clone()).await.unwrap();
    let err = store.insert_target(target("10.0.0.1", None)).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Archiving frees the address for re-registration.
    store.set_target_archived(t.id, Some(Utc::now())).await.unwrap();
    store.insert_target(target("10.0.0.1", None)).await.unwrap();
}

#[tokio::test]
async fn state_transition_writes_history_and_activity() {
    let store = MemoryStore::new();
    let t = target("10.0.0.1", None);
    store.insert_target(t.clone()).await.unwrap();

    let updated = store
        .transition_target_state(
            t.id,
            MonitoringState::Degraded,
            "responses stopped",
            "evaluator",
            None,
        )
        .await
        .unwrap();
    assert_eq!(updated.monitoring_state, MonitoringState::Degraded);

    let history = store.target_state_history(t.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_state, MonitoringState::Active);
    assert_eq!(history[0].new_state, MonitoringState::Degraded);

    let activity = store
        .list_activity(&ActivityFilter {
            target_id: Some(t.id),
            ..ActivityFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].event_type, "monitoring_state_changed");

    // Same-state transition is a no-op without a history row.
    store
        .transition_target_state(t.id, MonitoringState::Degraded, "again", "evaluator", None)
        .await
        .unwrap();
    assert_eq!(store.target_state_history(t.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn subnet_cascade_is_one_transaction_per_subnet() {
    let store = MemoryStore::new();
    let s = subnet("10.1.0.0/24", "ord");
    store.upsert_subnet(s.clone()).await.unwrap();
    let mut ids = Vec::new();
    for i in 1..=3 {
        let t = target(&format!("10.1.0.{i}"), Some(s.id));
        ids.push(t.id);
        store.insert_target(t).await.unwrap();
    }

    let moved = store
        .transition_targets_in_subnet(
            s.id,
            &[
                MonitoringState::Active,
                MonitoringState::Degraded,
                MonitoringState::Down,
            ],
            MonitoringState::Inactive,
            "service cancelled",
            "subnet_sync",
        )
        .await
        .unwrap();
    assert_eq!(moved.len(), 3);

    for id in ids {
        let t = store.get_target(id).await.unwrap().unwrap();
        assert_eq!(t.monitoring_state, MonitoringState::Inactive);
        assert_eq!(store.target_state_history(id, 10).await.unwrap().len(), 1);
    }
    let activity = store
        .list_activity(&ActivityFilter {
            subnet_id: Some(s.id),
            ..ActivityFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(activity.len(), 1);
}

#[tokio::test]
async fn smart_recheck_skips_covered_subnets() {
    let store = MemoryStore::new();
    let s = subnet("10.1.0.0/24", "ord");
    store.upsert_subnet(s.clone()).await.unwrap();

    let covered = target("10.1.0.1", Some(s.id));
    store.insert_target(covered).await.unwrap();

    let mut silent = target("10.1.0.2", Some(s.id));
    silent.monitoring_state = MonitoringState::Unresponsive;
    store.insert_target(silent.clone()).await.unwrap();

    // Subnet has an active customer target: nothing to re-check.
    assert!(store.targets_for_smart_recheck().await.unwrap().is_empty());

    store
        .transition_target_state(
            store.get_target_by_ip("10.1.0.1".parse().unwrap()).await.unwrap().unwrap().id,
            MonitoringState::Inactive,
            "cancelled",
            "operator",
            None,
        )
        .await
        .unwrap();
    let due = store.targets_for_smart_recheck().await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, silent.id);
}

#[tokio::test]
async fn alert_mutations_append_events_atomically() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let alert_id = Uuid::new_v4();
    let alert = Alert {
        id: alert_id,
        target_id: Uuid::new_v4(),
        agent_id: None,
        alert_type: AlertType::LatencyAnomaly,
        severity: AlertSeverity::Warning,
        initial_severity: AlertSeverity::Warning,
        peak_severity: AlertSeverity::Warning,
        status: AlertStatus::Active,
        metrics: AlertMetrics::default(),
        initial_metrics: AlertMetrics::default(),
        peak_metrics: AlertMetrics::default(),
        detected_at: now,
        last_updated_at: now,
        resolved_at: None,
        acknowledged_at: None,
        correlation_key: "target:x".to_string(),
        incident_id: None,
        enrichment: AlertEnrichment::default(),
        last_escalated_at: None,
    };
    let created = AlertEvent::new(alert_id, AlertEventType::Created, "created", "alert_worker", now);
    store.create_alert(alert.clone(), created).await.unwrap();

    let mut escalated = alert.clone();
    escalated.severity = AlertSeverity::Critical;
    escalated.peak_severity = AlertSeverity::Critical;
    let event = AlertEvent::new(
        alert_id,
        AlertEventType::Escalated,
        "warning -> critical",
        "alert_worker",
        now + Duration::seconds(10),
    );
    store.update_alert(&escalated, Some(event)).await.unwrap();

    let events = store.alert_events(alert_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, AlertEventType::Created);
    assert_eq!(events[1].event_type, AlertEventType::Escalated);
    for e in &events {
        assert!(e.created_at >= alert.detected_at);
    }

    // Updating a missing alert is NotFound, and no orphan event appears.
    let mut ghost = alert.clone();
    ghost.id = Uuid::new_v4();
    let orphan = AlertEvent::new(ghost.id, AlertEventType::Escalated, "", "alert_worker", now);
    assert!(matches!(
        store.update_alert(&ghost, Some(orphan)).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.alert_events(ghost.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn command_completes_at_quorum() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let a1 = agent("probe-1", "ord");
    let a2 = agent("probe-2", "nyc");
    let command = Command {
        id: Uuid::new_v4(),
        command: "mtr".to_string(),
        payload: serde_json::json!({"target": "10.0.0.1"}),
        agent_ids: vec![],
        quorum: 2,
        created_at: now,
        expires_at: now + Duration::minutes(10),
        completed_at: None,
    };
    store.create_command(command.clone()).await.unwrap();

    let pending = store.pending_commands_for_agent(a1.id, now).await.unwrap();
    assert_eq!(pending.len(), 1);

    let result = |agent_id| CommandResult {
        command_id: command.id,
        agent_id,
        success: true,
        output: serde_json::Value::Null,
        submitted_at: now,
    };
    store.submit_command_result(result(a1.id)).await.unwrap();
    assert!(store.get_command(command.id).await.unwrap().unwrap().completed_at.is_none());

    // An agent that answered no longer sees the command.
    assert!(store.pending_commands_for_agent(a1.id, now).await.unwrap().is_empty());

    store.submit_command_result(result(a2.id)).await.unwrap();
    assert!(store.get_command(command.id).await.unwrap().unwrap().completed_at.is_some());

    // Resubmission is a no-op.
    store.submit_command_result(result(a2.id)).await.unwrap();
}

#[tokio::test]
async fn representative_is_exclusive_per_subnet() {
    let store = MemoryStore::new();
    let s = subnet("10.1.0.0/24", "ord");
    store.upsert_subnet(s.clone()).await.unwrap();
    let t1 = target("10.1.0.1", Some(s.id));
    let t2 = target("10.1.0.2", Some(s.id));
    store.insert_target(t1.clone()).await.unwrap();
    store.insert_target(t2.clone()).await.unwrap();

    store.set_representative(s.id, t1.id).await.unwrap();
    store.set_representative(s.id, t2.id).await.unwrap();

    let reps: Vec<TargetId> = store
        .list_targets_in_subnet(s.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.is_representative)
        .map(|t| t.id)
        .collect();
    assert_eq!(reps, vec![t2.id]);
}

#[tokio::test]
async fn bulk_state_upsert_is_idempotent() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let state = PairState {
        agent_id: Uuid::new_v4(),
        target_id: Uuid::new_v4(),
        status: PairStatus::Healthy,
        status_since: now,
        current_z_score: Some(0.1),
        current_packet_loss: 0.0,
        current_latency_ms: Some(10.0),
        anomaly_start: None,
        consecutive_anomalies: 0,
        consecutive_successes: 5,
        last_probe_time: Some(now),
        last_evaluated: now,
    };
    store.bulk_upsert_pair_states(vec![state.clone()]).await.unwrap();
    store.bulk_upsert_pair_states(vec![state.clone()]).await.unwrap();
    let fetched = store.get_pair_state(state.key()).await.unwrap().unwrap();
    assert_eq!(fetched, state);
}

#[tokio::test]
async fn subnet_containment_prefers_longest_prefix() {
    let store = MemoryStore::new();
    let wide = subnet("10.0.0.0/16", "ord");
    let mut narrow = subnet("10.0.1.0/24", "ord");
    narrow.source = "manual".to_string(); // different source may nest
    store.upsert_subnet(wide).await.unwrap();
    store.upsert_subnet(narrow.clone()).await.unwrap();

    let hit = store
        .find_subnet_containing(Ipv4Addr::new(10, 0, 1, 7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hit.id, narrow.id);
}
