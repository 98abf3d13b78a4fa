//! # Control Plane End-to-End Scenarios
//!
//! Drives the assembled platform (memory store, real component services)
//! through the full pipeline: ingest → evaluate → alert → correlate, plus
//! assignment and lifecycle flows. Workers are not spawned; each tick is
//! driven explicitly so the scenarios are deterministic.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sentinel_core::operations::ControlPlane;
use sentinel_core::platform::{Platform, PlatformConfig, PlatformContext};
use sentinel_fleet::RegisterRequest;
use sentinel_store::*;

async fn harness() -> (PlatformContext, ControlPlane) {
    let mut config = PlatformConfig::default();
    config.observability.enable_metrics = false;
    let token = CancellationToken::new();
    let ctx = Platform::build_context(config, &token).await.unwrap();
    (ctx.clone(), ControlPlane::new(ctx))
}

async fn register_agent(cp: &ControlPlane, name: &str, region: &str) -> Agent {
    cp.register_agent(RegisterRequest {
        name: name.to_string(),
        region: region.to_string(),
        provider: "colo".to_string(),
        location: String::new(),
        public_ip: None,
        capabilities: vec![ProbeKind::Icmp],
        max_targets: None,
        version: "1.0.0".to_string(),
        tags: HashMap::new(),
    })
    .await
    .unwrap()
    .agent
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

fn target(ip: &str, tier: &str, subnet_id: Option<SubnetId>) -> Target {
    let now = Utc::now();
    Target {
        id: Uuid::new_v4(),
        ip: ip.parse().unwrap(),
        tier: tier.to_string(),
        ownership: Ownership::Auto,
        origin: TargetOrigin::Sync,
        ip_type: IpType::Customer,
        monitoring_state: MonitoringState::Active,
        state_changed_at: now,
        subnet_id,
        is_representative: false,
        needs_review: false,
        first_response_at: Some(now),
        last_response_at: Some(now),
        baseline_established_at: None,
        expected_outcome: None,
        tags: HashMap::new(),
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn probe(agent_id: AgentId, target_id: TargetId, secs_ago: i64, latency: f64) -> ProbeResult {
    ProbeResult {
        time: Utc::now() - Duration::seconds(secs_ago),
        target_id,
        agent_id,
        success: true,
        error: None,
        latency_ms: Some(latency),
        packet_loss_pct: Some(0.0),
        payload: None,
        agent_region: None,
        target_region: None,
        is_in_market: false,
    }
}

async fn ship_and_flush(ctx: &PlatformContext, cp: &ControlPlane, batch: ResultBatch) {
    cp.ship_results(batch).await.unwrap();
    sentinel_ingest::flush_once(&ctx.buffer(), ctx.store().as_ref(), 100_000)
        .await
        .unwrap();
}

// Scenario 1: results are enriched with regions at insert; in-market is
// true exactly when agent and target share a region.
#[tokio::test]
async fn scenario_ingest_and_enrich() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let a1 = register_agent(&cp, "probe-ord", "ord").await;
    let s_ord = subnet("10.1.0.0/24", "ord");
    let s_nyc = subnet("10.2.0.0/24", "nyc");
    store.upsert_subnet(s_ord.clone()).await.unwrap();
    store.upsert_subnet(s_nyc.clone()).await.unwrap();
    let t1 = target("10.1.0.5", "default", Some(s_ord.id));
    let t2 = target("10.2.0.5", "default", Some(s_nyc.id));
    cp.create_target(t1.clone()).await.unwrap();
    cp.create_target(t2.clone()).await.unwrap();

    ship_and_flush(
        &ctx,
        &cp,
        ResultBatch {
            agent_id: a1.id,
            batch_id: Uuid::new_v4(),
            results: vec![probe(a1.id, t1.id, 5, 12.0), probe(a1.id, t2.id, 5, 25.0)],
        },
    )
    .await;

    let since = Utc::now() - Duration::minutes(5);
    let rows = store.list_results_for_target(t1.id, since, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].agent_region.as_deref(), Some("ord"));
    assert_eq!(rows[0].target_region.as_deref(), Some("ord"));
    assert!(rows[0].is_in_market);

    let rows = store.list_results_for_target(t2.id, since, 10).await.unwrap();
    assert_eq!(rows[0].target_region.as_deref(), Some("nyc"));
    assert!(!rows[0].is_in_market);
}

// Scenario 2: 100 tight probes form a baseline (p50 ~ 10, p99 <= 13); the
// next 50ms probe scores dozens of deviations out and flags anomalous.
#[tokio::test]
async fn scenario_baseline_formation() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let a1 = register_agent(&cp, "probe-1", "ord").await;
    let t1 = target("10.0.0.1", "default", None);
    cp.create_target(t1.clone()).await.unwrap();

    let results: Vec<ProbeResult> = (0..100)
        .map(|i| probe(a1.id, t1.id, 600 + i * 60, 10.0 + ((i % 3) as f64 - 1.0)))
        .collect();
    ship_and_flush(
        &ctx,
        &cp,
        ResultBatch {
            agent_id: a1.id,
            batch_id: Uuid::new_v4(),
            results,
        },
    )
    .await;

    let updated = cp.recalculate_baselines().await.unwrap();
    assert_eq!(updated, 1);

    let key = PairKey {
        agent_id: a1.id,
        target_id: t1.id,
    };
    let baseline = store.get_baseline(key).await.unwrap().unwrap();
    assert!((baseline.latency_p50 - 10.0).abs() <= 1.0);
    assert!(baseline.latency_p99 <= 13.0);
    assert!(baseline.latency_stddev <= 1.5);
    assert_eq!(baseline.sample_count, 100);

    ship_and_flush(
        &ctx,
        &cp,
        ResultBatch {
            agent_id: a1.id,
            batch_id: Uuid::new_v4(),
            results: vec![probe(a1.id, t1.id, 2, 50.0)],
        },
    )
    .await;
    let summary = ctx.evaluator().run_tick().await.unwrap();
    assert_eq!(summary.anomalies, 1);

    let state = store.get_pair_state(key).await.unwrap().unwrap();
    assert!(state.current_z_score.unwrap() > 30.0);
    assert_eq!(state.consecutive_anomalies, 1);
}

// Scenario 3: the seeded vip tier wants 3 agents across >= 2 regions; ten
// agents in three regions yield exactly 3 assignments spanning >= 2
// regions, and a rerun changes nothing.
#[tokio::test]
async fn scenario_assignment_diversity() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let mut agents = Vec::new();
    for i in 0..10 {
        let a = register_agent(&cp, &format!("probe-{i}"), ["ord", "nyc", "lax"][i % 3]).await;
        // Fresh heartbeat so the engine sees them live.
        cp.heartbeat(
            a.id,
            HeartbeatPayload {
                status: "ok".to_string(),
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
        agents.push(a);
    }

    let t1 = target("10.0.0.1", "vip", None);
    cp.create_target(t1.clone()).await.unwrap();

    let v1 = cp.reassign_now().await.unwrap();
    let assignments = store.list_assignments().await.unwrap();
    assert_eq!(assignments.len(), 3);

    let regions: std::collections::HashSet<&str> = agents
        .iter()
        .filter(|a| assignments.iter().any(|x| x.agent_id == a.id))
        .map(|a| a.region.as_str())
        .collect();
    assert!(regions.len() >= 2);

    // Rerun: same set, no version bump.
    let v2 = cp.reassign_now().await.unwrap();
    assert_eq!(v1, v2);
    let again = store.list_assignments().await.unwrap();
    assert_eq!(assignments.len(), again.len());
    for a in &assignments {
        assert!(again.contains(a));
    }
}

// Scenario 4: alert evolution — created as warning, escalated to critical
// with monotone peak, auto-resolved once the quorum sees health, and a
// late recurrence (past the reopen grace) opens a fresh alert.
#[tokio::test]
async fn scenario_alert_evolution() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let agents = vec![
        register_agent(&cp, "probe-0", "ord").await,
        register_agent(&cp, "probe-1", "ord").await,
        register_agent(&cp, "probe-2", "nyc").await,
    ];
    let t1 = target("10.0.0.1", "default", None);
    cp.create_target(t1.clone()).await.unwrap();
    store
        .apply_assignment_diff(AssignmentDiff {
            added: agents
                .iter()
                .map(|a| Assignment {
                    target_id: t1.id,
                    agent_id: a.id,
                    tier: "default".to_string(),
                })
                .collect(),
            removed: vec![],
        })
        .await
        .unwrap();

    let state = |agent: &Agent, status: PairStatus, z: Option<f64>| PairState {
        agent_id: agent.id,
        target_id: t1.id,
        status,
        status_since: Utc::now(),
        current_z_score: z,
        current_packet_loss: 0.0,
        current_latency_ms: Some(40.0),
        anomaly_start: if status == PairStatus::Healthy { None } else { Some(Utc::now()) },
        consecutive_anomalies: 3,
        consecutive_successes: 0,
        last_probe_time: Some(Utc::now()),
        last_evaluated: Utc::now(),
    };

    // t=0: one agent degraded -> warning alert.
    store
        .bulk_upsert_pair_states(vec![state(&agents[0], PairStatus::Degraded, Some(4.0))])
        .await
        .unwrap();
    ctx.alerts().run_tick().await.unwrap();
    let alert = store.list_alerts_with_status(&[AlertStatus::Active]).await.unwrap()[0].clone();
    assert_eq!(alert.severity, AlertSeverity::Warning);

    // t=10s: worse -> escalated to critical; peak follows.
    store
        .bulk_upsert_pair_states(vec![state(&agents[0], PairStatus::Degraded, Some(9.0))])
        .await
        .unwrap();
    ctx.alerts().run_tick().await.unwrap();
    let alert = store.get_alert(alert.id).await.unwrap().unwrap();
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert_eq!(alert.peak_severity, AlertSeverity::Critical);

    let kinds: Vec<AlertEventType> = store
        .alert_events(alert.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(kinds, vec![AlertEventType::Created, AlertEventType::Escalated]);

    // t=5min: everyone sees it healthy -> auto-resolve appends resolved.
    store
        .bulk_upsert_pair_states(
            agents
                .iter()
                .map(|a| {
                    let mut s = state(a, PairStatus::Healthy, Some(0.1));
                    s.consecutive_anomalies = 0;
                    s.consecutive_successes = 3;
                    s
                })
                .collect(),
        )
        .await
        .unwrap();
    let summary = ctx.alerts().run_tick().await.unwrap();
    assert_eq!(summary.auto_resolved, 1);
    let resolved = store.get_alert(alert.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    // t=6min (past the 5-minute grace): a new anomaly opens a NEW alert
    // with its own event stream.
    let mut backdated = resolved.clone();
    backdated.resolved_at = Some(Utc::now() - Duration::minutes(6));
    store.update_alert(&backdated, None).await.unwrap();

    store
        .bulk_upsert_pair_states(vec![state(&agents[0], PairStatus::Degraded, Some(4.5))])
        .await
        .unwrap();
    let summary = ctx.alerts().run_tick().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.reopened, 0);

    let active = store.list_alerts_with_status(&[AlertStatus::Active]).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, alert.id);
    assert_eq!(store.alert_events(active[0].id).await.unwrap().len(), 1);
}

// Scenario 5: ten targets of one subnet fail from two agents; ten
// consensus alerts correlate into one regional incident with every alert
// linked and ten affected targets.
#[tokio::test]
async fn scenario_incident_correlation() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let a1 = register_agent(&cp, "probe-0", "ord").await;
    let a2 = register_agent(&cp, "probe-1", "ord").await;
    let s1 = subnet("10.1.0.0/24", "ord");
    store.upsert_subnet(s1.clone()).await.unwrap();

    let mut targets = Vec::new();
    for i in 1..=10 {
        let t = target(&format!("10.1.0.{i}"), "default", Some(s1.id));
        cp.create_target(t.clone()).await.unwrap();
        targets.push(t);
    }

    let now = Utc::now();
    let mut states = Vec::new();
    for t in &targets {
        for agent_id in [a1.id, a2.id] {
            states.push(PairState {
                agent_id,
                target_id: t.id,
                status: PairStatus::Down,
                status_since: now,
                current_z_score: None,
                current_packet_loss: 100.0,
                current_latency_ms: None,
                anomaly_start: Some(now),
                consecutive_anomalies: 5,
                consecutive_successes: 0,
                last_probe_time: Some(now),
                last_evaluated: now,
            });
        }
    }
    store.bulk_upsert_pair_states(states).await.unwrap();

    let summary = ctx.alerts().run_tick().await.unwrap();
    assert_eq!(summary.created, 10);

    let key = format!("subnet:{}", s1.id);
    let alerts = store.list_alerts_with_status(&[AlertStatus::Active]).await.unwrap();
    assert!(alerts.iter().all(|a| a.correlation_key == key));
    assert!(alerts.iter().all(|a| a.agent_id.is_none())); // consensus

    let summary = ctx.incidents().run_tick().await.unwrap();
    assert_eq!(summary.incidents_created, 1);
    assert_eq!(summary.alerts_linked, 10);

    let incident = store
        .find_active_incident_by_correlation(&key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.incident_type, IncidentType::Regional);
    assert_eq!(incident.affected_target_ids.len(), 10);

    for alert in &alerts {
        let linked = store.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(linked.incident_id, Some(incident.id));
        let events = store.alert_events(alert.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == AlertEventType::LinkedToIncident));
    }
}

// Scenario 6: flipping a subnet's service status to cancelled sweeps every
// live target to inactive in one transaction: state rows updated, one
// history row per target, one subnet-level activity entry.
#[tokio::test]
async fn scenario_service_cancellation_cascade() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let s1 = subnet("10.1.0.0/24", "ord");
    store.upsert_subnet(s1.clone()).await.unwrap();
    let mut ids = Vec::new();
    for i in 1..=4 {
        let t = target(&format!("10.1.0.{i}"), "default", Some(s1.id));
        ids.push(t.id);
        cp.create_target(t).await.unwrap();
    }

    let moved = cp
        .set_subnet_service_status(s1.id, SubnetServiceStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(moved.len(), 4);

    for id in &ids {
        let t = store.get_target(*id).await.unwrap().unwrap();
        assert_eq!(t.monitoring_state, MonitoringState::Inactive);
        assert_eq!(store.target_state_history(*id, 10).await.unwrap().len(), 1);
    }

    let activity = store
        .list_activity(&ActivityFilter {
            subnet_id: Some(s1.id),
            ..ActivityFilter::default()
        })
        .await
        .unwrap();
    let subnet_events: Vec<_> = activity
        .iter()
        .filter(|e| e.event_type == "subnet_targets_transitioned")
        .collect();
    assert_eq!(subnet_events.len(), 1);

    let fetched = store.get_subnet(s1.id).await.unwrap().unwrap();
    assert_eq!(fetched.service_status, SubnetServiceStatus::Cancelled);
}

// Supplemented flow: agents observe assignment changes through heartbeat
// staleness and pull a delta from their last seen version.
#[tokio::test]
async fn assignment_delta_flow() {
    let (ctx, cp) = harness().await;
    let store = ctx.store();

    let a1 = register_agent(&cp, "probe-0", "ord").await;
    let heartbeat = |version| HeartbeatPayload {
        status: "ok".to_string(),
        cpu_pct: 0.0,
        memory_pct: 0.0,
        tasks: 0,
        active_targets: 0,
        probes_per_second: 0.0,
        results_queued: 0,
        results_shipped: 0,
        assignment_version: version,
    };
    cp.heartbeat(a1.id, heartbeat(0)).await.unwrap();

    let t1 = target("10.0.0.1", "default", None);
    cp.create_target(t1.clone()).await.unwrap();
    cp.reassign_now().await.unwrap();

    let ack = cp.heartbeat(a1.id, heartbeat(0)).await.unwrap();
    assert!(ack.assignment_stale);

    match cp.fetch_assignments(a1.id, Some(0)).await.unwrap() {
        AssignmentFetch::Delta(delta) => {
            assert_eq!(delta.to_version, ack.assignment_version);
            assert_eq!(delta.added.len(), 1);
            assert_eq!(delta.added[0].target_id, t1.id);
            assert!(delta.removed.is_empty());
        }
        other => panic!("expected delta, got {other:?}"),
    }

    // Caught up: nothing to fetch.
    match cp
        .fetch_assignments(a1.id, Some(ack.assignment_version))
        .await
        .unwrap()
    {
        AssignmentFetch::UpToDate { version } => assert_eq!(version, ack.assignment_version),
        other => panic!("expected up-to-date, got {other:?}"),
    }

    // No known version: full set.
    match cp.fetch_assignments(a1.id, None).await.unwrap() {
        AssignmentFetch::Full(set) => {
            assert_eq!(set.assignments.len(), 1);
            assert_eq!(set.version, ack.assignment_version);
        }
        other => panic!("expected full set, got {other:?}"),
    }

    let ack = cp.heartbeat(a1.id, heartbeat(ack.assignment_version)).await.unwrap();
    assert!(!ack.assignment_stale);
}

// Fleet overview aggregates and caches; the cached copy serves the second
// read inside the TTL.
#[tokio::test]
async fn fleet_overview_snapshot() {
    let (_ctx, cp) = harness().await;
    register_agent(&cp, "probe-0", "ord").await;
    let t1 = target("10.0.0.1", "default", None);
    cp.create_target(t1).await.unwrap();

    let overview = cp.fleet_overview().await.unwrap();
    assert_eq!(overview.agents_total, 1);
    assert_eq!(overview.targets_total, 1);
    assert_eq!(overview.targets_by_state.get("active"), Some(&1));

    // Mutations inside the TTL are invisible by design.
    let t2 = target("10.0.0.2", "default", None);
    cp.create_target(t2).await.unwrap();
    let cached = cp.fleet_overview().await.unwrap();
    assert_eq!(cached.targets_total, 1);
}
