//! # Control Plane Operations
//!
//! The operation facade the transport layer calls into: agent-facing
//! (register, heartbeat, fetch assignments, ship results, commands) and
//! operator-facing (targets, tiers, subnets, alerts, incidents, metrics
//! queries, overviews). Semantics live here; wire shapes do not.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use sentinel_alerting::{hot_spots, HotSpot};
use sentinel_fleet::{FleetError, HeartbeatAck, RegisterRequest, RegisteredAgent};
use sentinel_ingest::IngestError;
use sentinel_store::{
    ActivityEntry, ActivityFilter, ActivityStore, AgentId, AgentSelectionPolicy, AgentStatus,
    AgentStore, Alert, AlertStatus, AlertStore, Assignment, AssignmentChange, AssignmentDelta,
    AssignmentFetch, AssignmentOp, AssignmentSet, AssignmentStore, Command, CommandResult,
    CommandStore, HeartbeatPayload, Incident, IncidentStatus, IncidentStore, MetricsQuery,
    MetricsRow, MonitoringState, ResultBatch, ResultStore, Store, StoreError, Subnet,
    SubnetServiceStatus, SubnetStore, Target, TargetId, TargetStore, Tier, TierStore,
};

use crate::platform::context::PlatformContext;

/// Facade error: everything callers need to map to a transport response.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Retryable; the caller should back off and retry
    #[error("temporarily unavailable: {0}")]
    Retryable(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("{0}")]
    Internal(String),
}

impl OpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OpError::Retryable(_) => true,
            OpError::Store(e) => e.is_retryable(),
            OpError::Fleet(FleetError::Store(e)) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Aggregate operational snapshot for the fleet dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetOverview {
    pub agents_total: usize,
    pub agents_by_status: HashMap<String, usize>,
    pub targets_total: usize,
    pub targets_by_state: HashMap<String, usize>,
    pub active_alerts: usize,
    pub active_incidents: usize,
    pub assignment_version: u64,
}

pub struct ControlPlane {
    ctx: PlatformContext,
}

impl ControlPlane {
    pub fn new(ctx: PlatformContext) -> Self {
        Self { ctx }
    }

    // ------------------------------------------------------------------
    // Agent-facing operations
    // ------------------------------------------------------------------

    pub async fn register_agent(&self, request: RegisterRequest) -> Result<RegisteredAgent, OpError> {
        Ok(self.ctx.registry().register(request).await?)
    }

    pub async fn heartbeat(
        &self,
        agent_id: AgentId,
        payload: HeartbeatPayload,
    ) -> Result<HeartbeatAck, OpError> {
        Ok(self.ctx.registry().heartbeat(agent_id, payload).await?)
    }

    /// Current assignments for an agent. With `from_version` the store's
    /// change journal yields a delta; beyond the journal horizon (or on a
    /// fresh agent) the full set comes back.
    pub async fn fetch_assignments(
        &self,
        agent_id: AgentId,
        from_version: Option<u64>,
    ) -> Result<AssignmentFetch, OpError> {
        let store = self.ctx.store();
        let current_version = store.current_assignment_version().await?;

        if let Some(from_version) = from_version {
            if from_version >= current_version {
                return Ok(AssignmentFetch::UpToDate {
                    version: current_version,
                });
            }
            if let Some(changes) = store.assignment_changes_since(agent_id, from_version).await? {
                let assignments = store.list_assignments_for_agent(agent_id).await?;
                return Ok(AssignmentFetch::Delta(collapse_changes(
                    from_version,
                    current_version,
                    changes,
                    &assignments,
                )));
            }
        }

        let assignments = store.list_assignments_for_agent(agent_id).await?;
        Ok(AssignmentFetch::Full(AssignmentSet {
            version: current_version,
            assignments,
        }))
    }

    /// Enqueue a result batch. A full buffer surfaces as retryable so the
    /// transport can answer with a retry-class failure.
    pub async fn ship_results(&self, batch: ResultBatch) -> Result<(), OpError> {
        self.ctx.buffer().enqueue(batch).await.map_err(|e| match e {
            IngestError::BufferFull { .. } => OpError::Retryable(e.to_string()),
            IngestError::Store(inner) => OpError::Store(inner),
        })
    }

    pub async fn fetch_commands(&self, agent_id: AgentId) -> Result<Vec<Command>, OpError> {
        Ok(self
            .ctx
            .store()
            .pending_commands_for_agent(agent_id, Utc::now())
            .await?)
    }

    pub async fn submit_command_result(&self, result: CommandResult) -> Result<(), OpError> {
        Ok(self.ctx.store().submit_command_result(result).await?)
    }

    // ------------------------------------------------------------------
    // Operator-facing operations
    // ------------------------------------------------------------------

    pub async fn create_target(&self, target: Target) -> Result<(), OpError> {
        Ok(self.ctx.store().insert_target(target).await?)
    }

    pub async fn update_target(&self, target: Target) -> Result<(), OpError> {
        Ok(self.ctx.store().update_target(target).await?)
    }

    pub async fn archive_target(&self, target_id: TargetId) -> Result<(), OpError> {
        Ok(self
            .ctx
            .store()
            .set_target_archived(target_id, Some(Utc::now()))
            .await?)
    }

    pub async fn change_target_state(
        &self,
        target_id: TargetId,
        state: MonitoringState,
        triggered_by: &str,
    ) -> Result<Target, OpError> {
        match state {
            MonitoringState::Inactive => Ok(self
                .ctx
                .lifecycle()
                .mark_inactive(target_id, triggered_by)
                .await
                .map_err(|e| OpError::Internal(e.to_string()))?),
            other => {
                let target = self
                    .ctx
                    .store()
                    .get_target(target_id)
                    .await?
                    .ok_or(StoreError::NotFound("target"))?;
                self.ctx
                    .lifecycle()
                    .transition(&target, other, "operator state change", triggered_by)
                    .await
                    .map_err(|e| OpError::InvalidInput(e.to_string()))
            }
        }
    }

    pub async fn acknowledge_target_review(&self, target_id: TargetId) -> Result<(), OpError> {
        self.ctx
            .lifecycle()
            .acknowledge_review(target_id)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    /// Target listing, served from the short-TTL cache when fresh.
    pub async fn list_targets(&self) -> Result<Vec<Target>, OpError> {
        let cache = self.ctx.cache();
        if let Some(value) = cache.get("target_list").await {
            if let Ok(targets) = serde_json::from_value(value) {
                return Ok(targets);
            }
        }
        let targets = self.ctx.store().list_targets().await?;
        if let Ok(value) = serde_json::to_value(&targets) {
            let ttl = Duration::from_secs(self.ctx.config().cache.target_list_ttl_secs);
            cache.put("target_list", value, ttl).await;
        }
        Ok(targets)
    }

    pub async fn upsert_tier(&self, tier: Tier) -> Result<(), OpError> {
        tier.selection.validate()?;
        Ok(self.ctx.store().upsert_tier(tier).await?)
    }

    pub async fn list_tiers(&self) -> Result<Vec<Tier>, OpError> {
        Ok(self.ctx.store().list_tiers().await?)
    }

    pub async fn upsert_subnet(&self, subnet: Subnet) -> Result<(), OpError> {
        Ok(self.ctx.store().upsert_subnet(subnet).await?)
    }

    pub async fn list_agents(&self) -> Result<Vec<sentinel_fleet::AgentWithStatus>, OpError> {
        Ok(self.ctx.registry().list_all().await?)
    }

    pub async fn archive_agent(&self, agent_id: AgentId, reason: &str, by: &str) -> Result<(), OpError> {
        Ok(self.ctx.registry().archive(agent_id, reason, by).await?)
    }

    pub async fn unarchive_agent(&self, agent_id: AgentId) -> Result<(), OpError> {
        Ok(self.ctx.registry().unarchive(agent_id).await?)
    }

    pub async fn list_alerts(&self, statuses: &[AlertStatus]) -> Result<Vec<Alert>, OpError> {
        Ok(self.ctx.store().list_alerts_with_status(statuses).await?)
    }

    pub async fn list_incidents(
        &self,
        statuses: &[IncidentStatus],
    ) -> Result<Vec<Incident>, OpError> {
        Ok(self.ctx.store().list_incidents_with_status(statuses).await?)
    }

    pub async fn set_subnet_service_status(
        &self,
        subnet_id: Uuid,
        status: SubnetServiceStatus,
    ) -> Result<Vec<TargetId>, OpError> {
        let subnet = self
            .ctx
            .store()
            .get_subnet(subnet_id)
            .await?
            .ok_or(StoreError::NotFound("subnet"))?;
        self.ctx
            .lifecycle()
            .on_subnet_service_change(&subnet, status)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn archive_subnet(&self, subnet_id: Uuid) -> Result<(), OpError> {
        self.ctx
            .lifecycle()
            .on_subnet_archived(subnet_id)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid, by: &str) -> Result<Alert, OpError> {
        self.ctx
            .alerts()
            .acknowledge(alert_id, by)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn resolve_alert(&self, alert_id: Uuid, by: &str) -> Result<Alert, OpError> {
        self.ctx
            .alerts()
            .resolve(alert_id, by)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn acknowledge_incident(&self, incident_id: Uuid) -> Result<Incident, OpError> {
        self.ctx
            .incidents()
            .acknowledge(incident_id)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn resolve_incident(&self, incident_id: Uuid) -> Result<Incident, OpError> {
        self.ctx
            .incidents()
            .resolve(incident_id)
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    /// Manual baseline recalculation; mutually exclusive with the tick via
    /// the evaluator's advisory lock.
    pub async fn recalculate_baselines(&self) -> Result<usize, OpError> {
        self.ctx
            .evaluator()
            .recalculate_baselines()
            .await
            .map_err(|e| OpError::Internal(e.to_string()))
    }

    pub async fn reassign_now(&self) -> Result<u64, OpError> {
        let summary = self
            .ctx
            .assignment()
            .run_once()
            .await
            .map_err(|e| OpError::Internal(e.to_string()))?;
        Ok(summary.version)
    }

    pub async fn metrics_query(&self, query: &MetricsQuery) -> Result<Vec<MetricsRow>, OpError> {
        Ok(self.ctx.store().metrics_query(query).await?)
    }

    pub async fn activity(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEntry>, OpError> {
        Ok(self.ctx.store().list_activity(filter).await?)
    }

    /// Hot-spot summary over active alerts, cached briefly.
    pub async fn alert_hot_spots(&self) -> Result<Vec<HotSpot>, OpError> {
        let cache = self.ctx.cache();
        if let Some(value) = cache.get("hot_spots").await {
            if let Ok(spots) = serde_json::from_value(value) {
                return Ok(spots);
            }
        }
        let alerts = self
            .ctx
            .store()
            .list_alerts_with_status(&[AlertStatus::Active, AlertStatus::Acknowledged])
            .await?;
        let spots = hot_spots(&alerts);
        if let Ok(value) = serde_json::to_value(&spots) {
            let ttl = Duration::from_secs(self.ctx.config().cache.hot_spots_ttl_secs);
            cache.put("hot_spots", value, ttl).await;
        }
        Ok(spots)
    }

    /// Fleet overview, served from the short-TTL cache when fresh.
    pub async fn fleet_overview(&self) -> Result<FleetOverview, OpError> {
        let cache = self.ctx.cache();
        if let Some(value) = cache.get("fleet_overview").await {
            if let Ok(overview) = serde_json::from_value(value) {
                return Ok(overview);
            }
        }

        let now = Utc::now();
        let store = self.ctx.store();
        let liveness = self.ctx.config().fleet.liveness();

        let agents = store.list_agents().await?;
        let mut agents_by_status: HashMap<String, usize> = HashMap::new();
        for agent in &agents {
            let status = agent.status(now, liveness);
            let key = match status {
                AgentStatus::Active => "active",
                AgentStatus::Degraded => "degraded",
                AgentStatus::Offline => "offline",
                AgentStatus::Archived => "archived",
            };
            *agents_by_status.entry(key.to_string()).or_insert(0) += 1;
        }

        let targets = store.list_targets().await?;
        let mut targets_by_state: HashMap<String, usize> = HashMap::new();
        for target in targets.iter().filter(|t| t.archived_at.is_none()) {
            let key = format!("{:?}", target.monitoring_state).to_lowercase();
            *targets_by_state.entry(key).or_insert(0) += 1;
        }

        let overview = FleetOverview {
            agents_total: agents.len(),
            agents_by_status,
            targets_total: targets.iter().filter(|t| t.archived_at.is_none()).count(),
            targets_by_state,
            active_alerts: store
                .list_alerts_with_status(&[AlertStatus::Active, AlertStatus::Acknowledged])
                .await?
                .len(),
            active_incidents: store
                .list_incidents_with_status(&[
                    IncidentStatus::Pending,
                    IncidentStatus::Active,
                    IncidentStatus::Acknowledged,
                ])
                .await?
                .len(),
            assignment_version: store.current_assignment_version().await?,
        };

        if let Ok(value) = serde_json::to_value(&overview) {
            let ttl = Duration::from_secs(self.ctx.config().cache.fleet_overview_ttl_secs);
            cache.put("fleet_overview", value, ttl).await;
        }
        Ok(overview)
    }
}

/// Fold journal changes into a net delta. Tier names for additions come
/// from the live assignment rows; a pair added then removed inside the
/// range cancels out.
fn collapse_changes(
    from_version: u64,
    to_version: u64,
    changes: Vec<AssignmentChange>,
    current: &[Assignment],
) -> AssignmentDelta {
    let tiers: HashMap<(TargetId, AgentId), &str> = current
        .iter()
        .map(|a| ((a.target_id, a.agent_id), a.tier.as_str()))
        .collect();

    let mut net: HashMap<(TargetId, AgentId), AssignmentOp> = HashMap::new();
    for change in changes {
        net.insert((change.target_id, change.agent_id), change.op);
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    for ((target_id, agent_id), op) in net {
        match op {
            AssignmentOp::Add => {
                if let Some(tier) = tiers.get(&(target_id, agent_id)) {
                    added.push(Assignment {
                        target_id,
                        agent_id,
                        tier: tier.to_string(),
                    });
                }
            }
            AssignmentOp::Remove => removed.push((target_id, agent_id)),
        }
    }
    AssignmentDelta {
        from_version,
        to_version,
        added,
        removed,
    }
}

/// Built-in tiers installed at first boot when the tier table is empty.
pub async fn seed_default_tiers(store: &dyn Store) -> Result<()> {
    if !store.list_tiers().await?.is_empty() {
        return Ok(());
    }

    let mut vip = AgentSelectionPolicy::distributed(3);
    vip.min_regions = 2;
    let mut gateway = AgentSelectionPolicy::distributed(3);
    gateway.min_providers = 2;

    let tiers = [
        Tier {
            name: "default".to_string(),
            probe_interval_secs: 60,
            timeout_ms: 2_000,
            retries: 2,
            selection: AgentSelectionPolicy::distributed(2),
            default_expected_outcome: None,
        },
        Tier {
            name: "vip".to_string(),
            probe_interval_secs: 30,
            timeout_ms: 2_000,
            retries: 3,
            selection: vip,
            default_expected_outcome: None,
        },
        Tier {
            name: "infrastructure".to_string(),
            probe_interval_secs: 10,
            timeout_ms: 1_000,
            retries: 3,
            selection: AgentSelectionPolicy::all(),
            default_expected_outcome: None,
        },
        Tier {
            name: "pilot_infra".to_string(),
            probe_interval_secs: 10,
            timeout_ms: 1_000,
            retries: 3,
            selection: AgentSelectionPolicy::all(),
            default_expected_outcome: None,
        },
        Tier {
            name: "vlan_gateway".to_string(),
            probe_interval_secs: 30,
            timeout_ms: 2_000,
            retries: 3,
            selection: gateway,
            default_expected_outcome: None,
        },
        Tier {
            name: "discovery".to_string(),
            probe_interval_secs: 300,
            timeout_ms: 3_000,
            retries: 1,
            selection: AgentSelectionPolicy::distributed(1),
            default_expected_outcome: None,
        },
        Tier {
            name: "smart_recheck".to_string(),
            probe_interval_secs: 600,
            timeout_ms: 3_000,
            retries: 1,
            selection: AgentSelectionPolicy::distributed(1),
            default_expected_outcome: None,
        },
        Tier {
            name: "slow".to_string(),
            probe_interval_secs: 3_600,
            timeout_ms: 3_000,
            retries: 1,
            selection: AgentSelectionPolicy::distributed(1),
            default_expected_outcome: None,
        },
    ];
    for tier in tiers {
        store.upsert_tier(tier).await?;
    }
    Ok(())
}
