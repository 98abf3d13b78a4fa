//! # Assignment Engine Unit Tests

use chrono::Utc;
use sentinel_assignment::*;
use sentinel_store::*;
use std::collections::HashMap;
use std::sync::Arc;
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
        max_targets: 0,
        version: String::new(),
        tags: HashMap::new(),
        api_key_hash: None,
        last_heartbeat: Some(now),
        archived_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn target(ip: &str, tier: &str) -> Target {
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
        subnet_id: None,
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

fn tier(name: &str, policy: AgentSelectionPolicy) -> Tier {
    Tier {
        name: name.to_string(),
        probe_interval_secs: 10,
        timeout_ms: 2_000,
        retries: 2,
        selection: policy,
        default_expected_outcome: None,
    }
}

async fn engine_with(store: Arc<MemoryStore>) -> AssignmentEngine {
    AssignmentEngine::new(
        store,
        AssignmentConfig::default(),
        LivenessThresholds::default(),
    )
}

#[tokio::test]
async fn vip_tier_selects_three_across_two_regions() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        store
            .insert_agent(agent(&format!("probe-{i}"), ["ord", "nyc", "lax"][i % 3]))
            .await
            .unwrap();
    }
    let mut policy = AgentSelectionPolicy::distributed(3);
    policy.min_regions = 2;
    store.upsert_tier(tier("vip", policy)).await.unwrap();

    let t = target("10.0.0.1", "vip");
    store.insert_target(t.clone()).await.unwrap();

    let engine = engine_with(store.clone()).await;
    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.added, 3);
    assert_eq!(summary.version, 1);

    let assignments = store.list_assignments().await.unwrap();
    assert_eq!(assignments.len(), 3);
    let agents = store.list_active_agents().await.unwrap();
    let regions: std::collections::HashSet<&str> = agents
        .iter()
        .filter(|a| assignments.iter().any(|x| x.agent_id == a.id))
        .map(|a| a.region.as_str())
        .collect();
    assert!(regions.len() >= 2);
}

#[tokio::test]
async fn rerun_with_unchanged_inputs_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..6 {
        store
            .insert_agent(agent(&format!("probe-{i}"), ["ord", "nyc"][i % 2]))
            .await
            .unwrap();
    }
    store
        .upsert_tier(tier("default", AgentSelectionPolicy::distributed(2)))
        .await
        .unwrap();
    for i in 1..=5 {
        store
            .insert_target(target(&format!("10.0.0.{i}"), "default"))
            .await
            .unwrap();
    }

    let engine = engine_with(store.clone()).await;
    let first = engine.run_once().await.unwrap();
    assert_eq!(first.version, 1);
    let before: Vec<Assignment> = store.list_assignments().await.unwrap();

    let second = engine.run_once().await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.removed, 0);
    // No diff means no version bump.
    assert_eq!(second.version, 1);
    let after: Vec<Assignment> = store.list_assignments().await.unwrap();
    assert_eq!(before.len(), after.len());
}

#[tokio::test]
async fn archived_and_offline_agents_get_no_work() {
    let store = Arc::new(MemoryStore::new());
    let live = agent("probe-live", "ord");
    let mut silent = agent("probe-silent", "ord");
    silent.last_heartbeat = None; // never heartbeated: offline
    let archived = agent("probe-archived", "ord");
    store.insert_agent(live.clone()).await.unwrap();
    store.insert_agent(silent.clone()).await.unwrap();
    store.insert_agent(archived.clone()).await.unwrap();
    store
        .set_agent_archived(archived.id, Some(Utc::now()))
        .await
        .unwrap();

    store
        .upsert_tier(tier("default", AgentSelectionPolicy::all()))
        .await
        .unwrap();
    store.insert_target(target("10.0.0.1", "default")).await.unwrap();

    let engine = engine_with(store.clone()).await;
    engine.run_once().await.unwrap();

    let assignments = store.list_assignments().await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].agent_id, live.id);
}

#[tokio::test]
async fn empty_pool_leaves_target_unassigned_with_warning() {
    let store = Arc::new(MemoryStore::new());
    store.insert_agent(agent("probe-1", "ord")).await.unwrap();
    let mut policy = AgentSelectionPolicy::distributed(1);
    policy.include_regions = vec!["mars".to_string()];
    store.upsert_tier(tier("exotic", policy)).await.unwrap();
    let t = target("10.0.0.1", "exotic");
    store.insert_target(t.clone()).await.unwrap();

    let engine = engine_with(store.clone()).await;
    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.added, 0);
    assert_eq!(summary.warnings, 1);
    // Empty diff: version stays put even though planning ran.
    assert_eq!(store.current_assignment_version().await.unwrap(), 0);

    let activity = store
        .list_activity(&ActivityFilter {
            target_id: Some(t.id),
            ..ActivityFilter::default()
        })
        .await
        .unwrap();
    assert!(activity.iter().any(|e| e.event_type == "assignment_pool_empty"));
}

#[tokio::test]
async fn unknown_targets_use_discovery_tier() {
    let store = Arc::new(MemoryStore::new());
    store.insert_agent(agent("probe-1", "ord")).await.unwrap();
    store
        .upsert_tier(tier("discovery", AgentSelectionPolicy::distributed(1)))
        .await
        .unwrap();
    store
        .upsert_tier(tier("default", AgentSelectionPolicy::all()))
        .await
        .unwrap();

    let mut t = target("10.0.0.1", "default");
    t.monitoring_state = MonitoringState::Unknown;
    store.insert_target(t.clone()).await.unwrap();

    let engine = engine_with(store.clone()).await;
    engine.run_once().await.unwrap();

    let assignments = store.list_assignments().await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].tier, "discovery");
}

#[tokio::test]
async fn agent_loss_reshuffles_and_bumps_version() {
    let store = Arc::new(MemoryStore::new());
    let agents: Vec<Agent> = (0..4).map(|i| agent(&format!("probe-{i}"), "ord")).collect();
    for a in &agents {
        store.insert_agent(a.clone()).await.unwrap();
    }
    store
        .upsert_tier(tier("default", AgentSelectionPolicy::distributed(2)))
        .await
        .unwrap();
    for i in 1..=4 {
        store
            .insert_target(target(&format!("10.0.0.{i}"), "default"))
            .await
            .unwrap();
    }

    let engine = engine_with(store.clone()).await;
    engine.run_once().await.unwrap();
    let before = store.list_assignments().await.unwrap();

    // Losing one agent only disturbs the targets it served.
    let lost = before[0].agent_id;
    store.set_agent_archived(lost, Some(Utc::now())).await.unwrap();
    let summary = engine.run_once().await.unwrap();
    assert!(summary.removed > 0);
    assert_eq!(summary.version, 2);

    let after = store.list_assignments().await.unwrap();
    assert!(after.iter().all(|a| a.agent_id != lost));
    // Stable hash keeps untouched pairs in place.
    let kept = before
        .iter()
        .filter(|a| a.agent_id != lost)
        .filter(|a| {
            after
                .iter()
                .any(|b| b.target_id == a.target_id && b.agent_id == a.agent_id)
        })
        .count();
    assert_eq!(kept, before.iter().filter(|a| a.agent_id != lost).count());
}

#[tokio::test]
async fn reinitialize_rebuilds_from_scratch() {
    let store = Arc::new(MemoryStore::new());
    store.insert_agent(agent("probe-1", "ord")).await.unwrap();
    store
        .upsert_tier(tier("default", AgentSelectionPolicy::all()))
        .await
        .unwrap();
    store.insert_target(target("10.0.0.1", "default")).await.unwrap();

    let engine = engine_with(store.clone()).await;
    engine.run_once().await.unwrap();
    let v1 = store.current_assignment_version().await.unwrap();

    let summary = engine.reinitialize().await.unwrap();
    assert_eq!(summary.added, 1);
    assert!(summary.version > v1);
    assert_eq!(store.list_assignments().await.unwrap().len(), 1);
}
