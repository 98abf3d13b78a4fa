//! # In-Memory Store Backend
//!
//! Reference backend used by the test suites and by `controld` when no
//! database is configured. Every table lives behind one `RwLock`, so each
//! store call is atomic by construction and matches the transactional
//! contract of the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;

use crate::query::{
    auto_bucket, select_aggregate_level, GroupBy, Metric, MetricsQuery, MetricsRow,
};
use crate::store::*;
use crate::types::*;

/// Journal entries retained for delta fetches before degrading to full sets
const JOURNAL_RETENTION: usize = 50_000;

#[derive(Default)]
struct MemoryState {
    agents: HashMap<AgentId, Agent>,
    agent_metrics: Vec<AgentMetricsRow>,
    subnets: HashMap<SubnetId, Subnet>,
    targets: HashMap<TargetId, Target>,
    target_history: Vec<TargetStateHistory>,
    tiers: HashMap<String, Tier>,
    assignments: HashMap<(TargetId, AgentId), Assignment>,
    assignment_version: u64,
    assignment_journal: Vec<AssignmentChange>,
    journal_horizon: u64,
    results: Vec<ProbeResult>,
    result_keys: HashSet<(DateTime<Utc>, TargetId, AgentId)>,
    baselines: HashMap<PairKey, PairBaseline>,
    pair_states: HashMap<PairKey, PairState>,
    alerts: HashMap<AlertId, Alert>,
    alert_events: Vec<AlertEvent>,
    incidents: HashMap<IncidentId, Incident>,
    activity: Vec<ActivityEntry>,
    commands: HashMap<CommandId, Command>,
    command_results: HashMap<(CommandId, AgentId), CommandResult>,
    alert_config: AlertConfig,
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn target_region(state: &MemoryState, target: &Target) -> Option<String> {
    target
        .subnet_id
        .and_then(|sid| state.subnets.get(&sid))
        .and_then(|s| s.region.clone())
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_agent(&self, agent: Agent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.agents.values().any(|a| a.name == agent.name) {
            return Err(StoreError::Conflict(format!(
                "agent name '{}' already registered",
                agent.name
            )));
        }
        state.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn update_agent(&self, agent: Agent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .agents
            .get_mut(&agent.id)
            .ok_or(StoreError::NotFound("agent"))?;
        // Heartbeat and key hash are owned by their dedicated paths.
        let last_heartbeat = existing.last_heartbeat;
        let api_key_hash = existing.api_key_hash.clone();
        *existing = agent;
        existing.last_heartbeat = last_heartbeat;
        existing.api_key_hash = api_key_hash;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        Ok(self.state.read().await.agents.get(&id).cloned())
    }

    async fn get_agent_by_name(&self, name: &str) -> StoreResult<Option<Agent>> {
        Ok(self
            .state
            .read()
            .await
            .agents
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.state.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn list_active_agents(&self) -> StoreResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self
            .state
            .read()
            .await
            .agents
            .values()
            .filter(|a| a.archived_at.is_none())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn record_heartbeat(
        &self,
        id: AgentId,
        at: DateTime<Utc>,
        metrics: AgentMetricsRow,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or(StoreError::NotFound("agent"))?;
        if agent.archived_at.is_some() {
            return Ok(false);
        }
        // Forward only; a replayed heartbeat can't regress freshness.
        if agent.last_heartbeat.map(|hb| at > hb).unwrap_or(true) {
            agent.last_heartbeat = Some(at);
        }
        state.agent_metrics.push(metrics);
        Ok(true)
    }

    async fn set_agent_archived(
        &self,
        id: AgentId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or(StoreError::NotFound("agent"))?;
        agent.archived_at = archived_at;
        Ok(())
    }

    async fn set_agent_api_key_hash(&self, id: AgentId, hash: Option<String>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or(StoreError::NotFound("agent"))?;
        agent.api_key_hash = hash;
        Ok(())
    }

    async fn list_agent_metrics(
        &self,
        id: AgentId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AgentMetricsRow>> {
        Ok(self
            .state
            .read()
            .await
            .agent_metrics
            .iter()
            .filter(|m| m.agent_id == id && m.time >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubnetStore for MemoryStore {
    async fn upsert_subnet(&self, subnet: Subnet) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let overlap = state.subnets.values().find(|s| {
            s.id != subnet.id
                && s.archived_at.is_none()
                && s.source == subnet.source
                && (s.cidr.contains(&subnet.cidr.network()) || subnet.cidr.contains(&s.cidr.network()))
        });
        if let Some(other) = overlap {
            return Err(StoreError::Conflict(format!(
                "subnet {} overlaps active subnet {} of source '{}'",
                subnet.cidr, other.cidr, other.source
            )));
        }
        state.subnets.insert(subnet.id, subnet);
        Ok(())
    }

    async fn get_subnet(&self, id: SubnetId) -> StoreResult<Option<Subnet>> {
        Ok(self.state.read().await.subnets.get(&id).cloned())
    }

    async fn list_subnets(&self) -> StoreResult<Vec<Subnet>> {
        Ok(self.state.read().await.subnets.values().cloned().collect())
    }

    async fn list_active_subnets(&self) -> StoreResult<Vec<Subnet>> {
        Ok(self
            .state
            .read()
            .await
            .subnets
            .values()
            .filter(|s| s.archived_at.is_none())
            .cloned()
            .collect())
    }

    async fn find_subnet_containing(&self, ip: Ipv4Addr) -> StoreResult<Option<Subnet>> {
        let state = self.state.read().await;
        Ok(state
            .subnets
            .values()
            .filter(|s| s.archived_at.is_none() && s.contains(ip))
            .max_by_key(|s| s.cidr.prefix_len())
            .cloned())
    }

    async fn set_subnet_service_status(
        &self,
        id: SubnetId,
        status: SubnetServiceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let subnet = state.subnets.get_mut(&id).ok_or(StoreError::NotFound("subnet"))?;
        if subnet.service_status != status {
            subnet.service_status = status;
            subnet.service_status_changed_at = Some(at);
            subnet.updated_at = at;
        }
        Ok(())
    }

    async fn set_subnet_archived(
        &self,
        id: SubnetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let subnet = state.subnets.get_mut(&id).ok_or(StoreError::NotFound("subnet"))?;
        subnet.archived_at = archived_at;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn insert_target(&self, target: Target) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .targets
            .values()
            .any(|t| t.ip == target.ip && t.archived_at.is_none() && t.id != target.id)
        {
            return Err(StoreError::Conflict(format!(
                "target ip {} already monitored",
                target.ip
            )));
        }
        state.targets.insert(target.id, target);
        Ok(())
    }

    async fn update_target(&self, target: Target) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .targets
            .get_mut(&target.id)
            .ok_or(StoreError::NotFound("target"))?;
        // State changes go through transition_target_state.
        let monitoring_state = existing.monitoring_state;
        let state_changed_at = existing.state_changed_at;
        *existing = target;
        existing.monitoring_state = monitoring_state;
        existing.state_changed_at = state_changed_at;
        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> StoreResult<Option<Target>> {
        Ok(self.state.read().await.targets.get(&id).cloned())
    }

    async fn get_target_by_ip(&self, ip: Ipv4Addr) -> StoreResult<Option<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .values()
            .find(|t| t.ip == ip && t.archived_at.is_none())
            .cloned())
    }

    async fn list_targets(&self) -> StoreResult<Vec<Target>> {
        let mut targets: Vec<Target> = self.state.read().await.targets.values().cloned().collect();
        targets.sort_by_key(|t| t.id);
        Ok(targets)
    }

    async fn list_targets_in_states(
        &self,
        states: &[MonitoringState],
    ) -> StoreResult<Vec<Target>> {
        let mut targets: Vec<Target> = self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| t.archived_at.is_none() && states.contains(&t.monitoring_state))
            .cloned()
            .collect();
        targets.sort_by_key(|t| t.id);
        Ok(targets)
    }

    async fn list_targets_in_subnet(&self, subnet_id: SubnetId) -> StoreResult<Vec<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| t.subnet_id == Some(subnet_id))
            .cloned()
            .collect())
    }

    async fn set_target_archived(
        &self,
        id: TargetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let target = state.targets.get_mut(&id).ok_or(StoreError::NotFound("target"))?;
        target.archived_at = archived_at;
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
        let mut state = self.state.write().await;
        let target = state.targets.get_mut(&id).ok_or(StoreError::NotFound("target"))?;
        let old_state = target.monitoring_state;
        if old_state == new_state {
            return Ok(target.clone());
        }
        target.monitoring_state = new_state;
        target.state_changed_at = now;
        target.updated_at = now;
        if let Some(review) = needs_review {
            target.needs_review = review;
        }
        let updated = target.clone();

        state.target_history.push(TargetStateHistory {
            id: uuid::Uuid::new_v4(),
            target_id: id,
            old_state,
            new_state,
            reason: reason.to_string(),
            triggered_by: triggered_by.to_string(),
            created_at: now,
        });
        let mut entry = ActivityEntry::new(
            ActivityCategory::Target,
            "monitoring_state_changed",
            triggered_by,
            now,
        );
        entry.target_id = Some(id);
        entry.subnet_id = updated.subnet_id;
        entry.ip = Some(updated.ip);
        entry.details = serde_json::json!({
            "old_state": old_state,
            "new_state": new_state,
            "reason": reason,
        });
        state.activity.push(entry);
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
        let mut state = self.state.write().await;
        let ids: Vec<TargetId> = state
            .targets
            .values()
            .filter(|t| {
                t.subnet_id == Some(subnet_id)
                    && t.archived_at.is_none()
                    && from_states.contains(&t.monitoring_state)
            })
            .map(|t| t.id)
            .collect();

        for id in &ids {
            let old_state = {
                let target = state.targets.get_mut(id).expect("id from same lock scope");
                let old = target.monitoring_state;
                target.monitoring_state = new_state;
                target.state_changed_at = now;
                target.updated_at = now;
                old
            };
            state.target_history.push(TargetStateHistory {
                id: uuid::Uuid::new_v4(),
                target_id: *id,
                old_state,
                new_state,
                reason: reason.to_string(),
                triggered_by: triggered_by.to_string(),
                created_at: now,
            });
        }

        let mut entry = ActivityEntry::new(
            ActivityCategory::Subnet,
            "subnet_targets_transitioned",
            triggered_by,
            now,
        );
        entry.subnet_id = Some(subnet_id);
        entry.details = serde_json::json!({
            "new_state": new_state,
            "reason": reason,
            "target_count": ids.len(),
        });
        state.activity.push(entry);
        Ok(ids)
    }

    async fn bulk_touch_target_responses(
        &self,
        touches: Vec<TargetResponseTouch>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for touch in touches {
            if let Some(target) = state.targets.get_mut(&touch.target_id) {
                if let Some(at) = touch.responded_at {
                    if target.first_response_at.is_none() {
                        target.first_response_at = Some(at);
                    }
                    if target.last_response_at.map(|prev| at > prev).unwrap_or(true) {
                        target.last_response_at = Some(at);
                    }
                }
                if target.baseline_established_at.is_none() {
                    target.baseline_established_at = touch.baseline_established_at;
                }
            }
        }
        Ok(())
    }

    async fn set_representative(
        &self,
        subnet_id: SubnetId,
        target_id: TargetId,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.targets.contains_key(&target_id) {
            return Err(StoreError::NotFound("target"));
        }
        for target in state.targets.values_mut() {
            if target.subnet_id == Some(subnet_id) {
                target.is_representative = target.id == target_id;
            }
        }
        Ok(())
    }

    async fn list_representative_candidates(
        &self,
        subnet_id: SubnetId,
    ) -> StoreResult<Vec<Target>> {
        let mut candidates: Vec<Target> = self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| {
                t.subnet_id == Some(subnet_id)
                    && t.archived_at.is_none()
                    && t.ip_type == IpType::Customer
                    && t.monitoring_state == MonitoringState::Standby
                    && t.baseline_established_at.is_some()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|t| t.baseline_established_at);
        Ok(candidates)
    }

    async fn target_state_history(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> StoreResult<Vec<TargetStateHistory>> {
        let state = self.state.read().await;
        let mut rows: Vec<TargetStateHistory> = state
            .target_history
            .iter()
            .filter(|h| h.target_id == target_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| std::cmp::Reverse(h.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn targets_eligible_for_down(
        &self,
        now: DateTime<Utc>,
        down_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| {
                t.archived_at.is_none()
                    && t.monitoring_state == MonitoringState::Degraded
                    && t.baseline_established_at.is_some()
                    && t.last_response_at
                        .map(|at| now - at >= down_after)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn targets_eligible_for_unresponsive(
        &self,
        now: DateTime<Utc>,
        unresponsive_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| {
                t.archived_at.is_none()
                    && t.monitoring_state == MonitoringState::Unknown
                    && t.first_response_at.is_none()
                    && now - t.created_at >= unresponsive_after
            })
            .cloned()
            .collect())
    }

    async fn targets_eligible_for_excluded(
        &self,
        now: DateTime<Utc>,
        exclude_after: Duration,
    ) -> StoreResult<Vec<Target>> {
        Ok(self
            .state
            .read()
            .await
            .targets
            .values()
            .filter(|t| {
                t.archived_at.is_none()
                    && t.monitoring_state == MonitoringState::Down
                    && now - t.state_changed_at >= exclude_after
            })
            .cloned()
            .collect())
    }

    async fn targets_for_smart_recheck(&self) -> StoreResult<Vec<Target>> {
        let state = self.state.read().await;
        let subnets_with_active_customers: HashSet<SubnetId> = state
            .targets
            .values()
            .filter(|t| {
                t.archived_at.is_none()
                    && t.ip_type == IpType::Customer
                    && t.monitoring_state == MonitoringState::Active
            })
            .filter_map(|t| t.subnet_id)
            .collect();

        Ok(state
            .targets
            .values()
            .filter(|t| {
                t.archived_at.is_none()
                    && matches!(
                        t.monitoring_state,
                        MonitoringState::Unresponsive | MonitoringState::Excluded
                    )
                    && t.subnet_id
                        .map(|sid| !subnets_with_active_customers.contains(&sid))
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TierStore for MemoryStore {
    async fn upsert_tier(&self, tier: Tier) -> StoreResult<()> {
        tier.selection.validate()?;
        self.state.write().await.tiers.insert(tier.name.clone(), tier);
        Ok(())
    }

    async fn get_tier(&self, name: &str) -> StoreResult<Option<Tier>> {
        Ok(self.state.read().await.tiers.get(name).cloned())
    }

    async fn list_tiers(&self) -> StoreResult<Vec<Tier>> {
        let mut tiers: Vec<Tier> = self.state.read().await.tiers.values().cloned().collect();
        tiers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tiers)
    }

    async fn delete_tier(&self, name: &str) -> StoreResult<()> {
        self.state
            .write()
            .await
            .tiers
            .remove(name)
            .map(|_| ())
            .ok_or(StoreError::NotFound("tier"))
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn list_assignments(&self) -> StoreResult<Vec<Assignment>> {
        Ok(self.state.read().await.assignments.values().cloned().collect())
    }

    async fn list_assignments_for_agent(&self, agent_id: AgentId) -> StoreResult<Vec<Assignment>> {
        Ok(self
            .state
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn agents_assigned_to_target(&self, target_id: TargetId) -> StoreResult<Vec<AgentId>> {
        Ok(self
            .state
            .read()
            .await
            .assignments
            .values()
            .filter(|a| a.target_id == target_id)
            .map(|a| a.agent_id)
            .collect())
    }

    async fn apply_assignment_diff(&self, diff: AssignmentDiff) -> StoreResult<u64> {
        if diff.is_empty() {
            return Err(StoreError::InvalidInput(
                "assignment diff is empty".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        let version = state.assignment_version + 1;

        for (target_id, agent_id) in &diff.removed {
            state.assignments.remove(&(*target_id, *agent_id));
            state.assignment_journal.push(AssignmentChange {
                version,
                target_id: *target_id,
                agent_id: *agent_id,
                op: AssignmentOp::Remove,
            });
        }
        for assignment in diff.added {
            state.assignment_journal.push(AssignmentChange {
                version,
                target_id: assignment.target_id,
                agent_id: assignment.agent_id,
                op: AssignmentOp::Add,
            });
            state
                .assignments
                .insert((assignment.target_id, assignment.agent_id), assignment);
        }
        state.assignment_version = version;

        if state.assignment_journal.len() > JOURNAL_RETENTION {
            let drop = state.assignment_journal.len() - JOURNAL_RETENTION;
            state.assignment_journal.drain(..drop);
            state.journal_horizon = state
                .assignment_journal
                .first()
                .map(|c| c.version.saturating_sub(1))
                .unwrap_or(version);
        }
        Ok(version)
    }

    async fn current_assignment_version(&self) -> StoreResult<u64> {
        Ok(self.state.read().await.assignment_version)
    }

    async fn assignment_changes_since(
        &self,
        agent_id: AgentId,
        from_version: u64,
    ) -> StoreResult<Option<Vec<AssignmentChange>>> {
        let state = self.state.read().await;
        if from_version < state.journal_horizon {
            return Ok(None);
        }
        Ok(Some(
            state
                .assignment_journal
                .iter()
                .filter(|c| c.version > from_version && c.agent_id == agent_id)
                .cloned()
                .collect(),
        ))
    }

    async fn delete_all_assignments(&self) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.assignments.clear();
        state.assignment_journal.clear();
        state.journal_horizon = state.assignment_version;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn bulk_insert_results(&self, results: Vec<ProbeResult>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut inserted = 0u64;
        for mut result in results {
            let key = (result.time, result.target_id, result.agent_id);
            if state.result_keys.contains(&key) {
                continue;
            }
            let agent_region = state
                .agents
                .get(&result.agent_id)
                .map(|a| a.region.clone())
                .filter(|r| !r.is_empty());
            let tgt_region = state
                .targets
                .get(&result.target_id)
                .and_then(|t| target_region(&state, t));
            result.is_in_market = match (&agent_region, &tgt_region) {
                (Some(a), Some(t)) => a == t,
                _ => false,
            };
            result.agent_region = agent_region;
            result.target_region = tgt_region;
            state.result_keys.insert(key);
            state.results.push(result);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn active_pairs_since(&self, window_start: DateTime<Utc>) -> StoreResult<Vec<PairKey>> {
        let state = self.state.read().await;
        let mut pairs: HashSet<PairKey> = HashSet::new();
        for r in state.results.iter().filter(|r| r.time >= window_start) {
            let agent_live = state
                .agents
                .get(&r.agent_id)
                .map(|a| a.archived_at.is_none())
                .unwrap_or(false);
            let target_live = state
                .targets
                .get(&r.target_id)
                .map(|t| t.archived_at.is_none())
                .unwrap_or(false);
            if agent_live && target_live {
                pairs.insert(PairKey {
                    agent_id: r.agent_id,
                    target_id: r.target_id,
                });
            }
        }
        let mut pairs: Vec<PairKey> = pairs.into_iter().collect();
        pairs.sort_by_key(|p| (p.target_id, p.agent_id));
        Ok(pairs)
    }

    async fn bulk_pair_window_stats(
        &self,
        pairs: &[PairKey],
        window_start: DateTime<Utc>,
    ) -> StoreResult<Vec<PairWindowStats>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for chunk in chunk_pairs(pairs) {
            let wanted: HashSet<PairKey> = chunk.iter().copied().collect();
            let mut acc: HashMap<PairKey, (Vec<&ProbeResult>,)> = HashMap::new();
            for r in state.results.iter().filter(|r| r.time >= window_start) {
                let key = PairKey {
                    agent_id: r.agent_id,
                    target_id: r.target_id,
                };
                if wanted.contains(&key) {
                    acc.entry(key).or_default().0.push(r);
                }
            }
            for (key, (mut rows,)) in acc {
                rows.sort_by_key(|r| r.time);
                let sample_count = rows.len() as u64;
                let success_count = rows.iter().filter(|r| r.success).count() as u64;
                let latencies: Vec<f64> =
                    rows.iter().filter_map(|r| r.latency_ms).collect();
                let avg_latency_ms = if latencies.is_empty() {
                    None
                } else {
                    Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
                };
                let loss_sum: f64 = rows.iter().filter_map(|r| r.packet_loss_pct).sum();
                let loss_n = rows.iter().filter(|r| r.packet_loss_pct.is_some()).count();
                let failures = sample_count - success_count;
                // Failed probes count as full loss when the agent reported none.
                let packet_loss_pct = if sample_count == 0 {
                    0.0
                } else if loss_n > 0 {
                    loss_sum / loss_n as f64
                } else {
                    failures as f64 * 100.0 / sample_count as f64
                };
                let last = rows.last();
                out.push(PairWindowStats {
                    agent_id: key.agent_id,
                    target_id: key.target_id,
                    sample_count,
                    success_count,
                    avg_latency_ms,
                    last_latency_ms: last.and_then(|r| r.latency_ms),
                    packet_loss_pct,
                    last_probe_time: last.map(|r| r.time),
                    last_success: last.map(|r| r.success),
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
        let state = self.state.read().await;
        let mut samples = BaselineSamples::default();
        for r in state.results.iter().filter(|r| {
            r.time >= since && r.agent_id == pair.agent_id && r.target_id == pair.target_id
        }) {
            samples.total_count += 1;
            if samples
                .first_seen
                .map(|prev| r.time < prev)
                .unwrap_or(true)
            {
                samples.first_seen = Some(r.time);
            }
            if r.success {
                samples.success_count += 1;
                if let Some(lat) = r.latency_ms {
                    samples.latencies_ms.push(lat);
                }
                samples.loss_values_pct.push(r.packet_loss_pct.unwrap_or(0.0));
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
        let state = self.state.read().await;
        let mut rows: Vec<ProbeResult> = state
            .results
            .iter()
            .filter(|r| r.target_id == target_id && r.time >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.time));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn metrics_query(&self, query: &MetricsQuery) -> StoreResult<Vec<MetricsRow>> {
        let now = Utc::now();
        let (start, end) = query.range.resolve(now)?;
        let window = end - start;
        let bucket_override = query.bucket.map(Duration::seconds);
        let level = select_aggregate_level(window, bucket_override);
        let bucket = bucket_override.unwrap_or_else(|| auto_bucket(window, level));

        let state = self.state.read().await;
        let mut groups: HashMap<(DateTime<Utc>, Vec<(String, String)>), Vec<&ProbeResult>> =
            HashMap::new();

        'rows: for r in state
            .results
            .iter()
            .filter(|r| r.time >= start && r.time < end)
        {
            let agent = state.agents.get(&r.agent_id);
            let target = state.targets.get(&r.target_id);

            let af = &query.agent_filter;
            if !af.ids.is_empty() && !af.ids.contains(&r.agent_id) {
                continue;
            }
            if let Some(agent) = agent {
                if !af.regions.is_empty() && !af.regions.contains(&agent.region) {
                    continue;
                }
                if !af.providers.is_empty() && !af.providers.contains(&agent.provider) {
                    continue;
                }
                for tf in &af.tag_filters {
                    if !tf.matches(&agent.tags)? {
                        continue 'rows;
                    }
                }
            }
            let tf_ = &query.target_filter;
            if !tf_.ids.is_empty() && !tf_.ids.contains(&r.target_id) {
                continue;
            }
            if let Some(target) = target {
                if !tf_.tiers.is_empty() && !tf_.tiers.contains(&target.tier) {
                    continue;
                }
                if !tf_.regions.is_empty() {
                    match target_region(&state, target) {
                        Some(region) if tf_.regions.contains(&region) => {}
                        _ => continue,
                    }
                }
                for tf in &tf_.tag_filters {
                    if !tf.matches(&target.tags)? {
                        continue 'rows;
                    }
                }
            }

            let offset = (r.time - start).num_seconds() / bucket.num_seconds().max(1);
            let bucket_start = bucket_floor(start + Duration::seconds(offset * bucket.num_seconds()), level);

            let mut dims: Vec<(String, String)> = Vec::new();
            for g in &query.group_by {
                let (name, value) = match g {
                    GroupBy::Time => continue,
                    GroupBy::Agent => ("agent", r.agent_id.to_string()),
                    GroupBy::AgentRegion => (
                        "agent_region",
                        r.agent_region.clone().unwrap_or_default(),
                    ),
                    GroupBy::AgentProvider => (
                        "agent_provider",
                        agent.map(|a| a.provider.clone()).unwrap_or_default(),
                    ),
                    GroupBy::Target => ("target", r.target_id.to_string()),
                    GroupBy::TargetTier => (
                        "target_tier",
                        target.map(|t| t.tier.clone()).unwrap_or_default(),
                    ),
                    GroupBy::TargetRegion => (
                        "target_region",
                        r.target_region.clone().unwrap_or_default(),
                    ),
                };
                dims.push((name.to_string(), value));
            }
            groups.entry((bucket_start, dims)).or_default().push(r);
        }

        let mut rows = Vec::new();
        for ((bucket_start, dims), members) in groups {
            let mut latencies: Vec<f64> = members.iter().filter_map(|r| r.latency_ms).collect();
            latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let successes = members.iter().filter(|r| r.success).count() as f64;
            let count = members.len() as f64;

            let mut values = HashMap::new();
            for metric in &query.metrics {
                let value = match metric {
                    Metric::AvgLatency => mean(&latencies),
                    Metric::MinLatency => latencies.first().copied(),
                    Metric::MaxLatency => latencies.last().copied(),
                    Metric::P50Latency => percentile(&latencies, 50.0),
                    Metric::P95Latency => percentile(&latencies, 95.0),
                    Metric::P99Latency => percentile(&latencies, 99.0),
                    Metric::Jitter => stddev(&latencies),
                    Metric::PacketLoss => {
                        let vals: Vec<f64> =
                            members.iter().filter_map(|r| r.packet_loss_pct).collect();
                        mean(&vals)
                    }
                    Metric::SuccessRate => Some(successes * 100.0 / count.max(1.0)),
                    Metric::ProbeCount => Some(count),
                };
                if let Some(v) = value {
                    values.insert(*metric, v);
                }
            }
            rows.push(MetricsRow {
                bucket_start,
                dimensions: dims.into_iter().collect(),
                values,
            });
        }
        rows.sort_by_key(|r| r.bucket_start);
        Ok(rows)
    }

    async fn prune_results(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let old_len = state.results.len();
        state.results.retain(|r| r.time >= before);
        state
            .result_keys
            .retain(|(time, _, _)| *time >= before);
        Ok((old_len - state.results.len()) as u64)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn stddev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Align a bucket start to the aggregate grid (months align to month start).
fn bucket_floor(at: DateTime<Utc>, level: crate::query::AggregateLevel) -> DateTime<Utc> {
    match level {
        crate::query::AggregateLevel::Monthly => Utc
            .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(at),
        _ => at,
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn get_baseline(&self, pair: PairKey) -> StoreResult<Option<PairBaseline>> {
        Ok(self.state.read().await.baselines.get(&pair).cloned())
    }

    async fn bulk_get_baselines(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairBaseline>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for chunk in chunk_pairs(pairs) {
            out.extend(chunk.iter().filter_map(|p| state.baselines.get(p)).cloned());
        }
        Ok(out)
    }

    async fn bulk_upsert_baselines(&self, baselines: Vec<PairBaseline>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for baseline in baselines {
            state.baselines.insert(baseline.key(), baseline);
        }
        Ok(())
    }

    async fn delete_baselines_for_target(&self, target_id: TargetId) -> StoreResult<()> {
        self.state
            .write()
            .await
            .baselines
            .retain(|k, _| k.target_id != target_id);
        Ok(())
    }
}

#[async_trait]
impl PairStateStore for MemoryStore {
    async fn get_pair_state(&self, pair: PairKey) -> StoreResult<Option<PairState>> {
        Ok(self.state.read().await.pair_states.get(&pair).cloned())
    }

    async fn bulk_get_pair_states(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairState>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for chunk in chunk_pairs(pairs) {
            out.extend(chunk.iter().filter_map(|p| state.pair_states.get(p)).cloned());
        }
        Ok(out)
    }

    async fn bulk_upsert_pair_states(&self, states: Vec<PairState>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for s in states {
            state.pair_states.insert(s.key(), s);
        }
        Ok(())
    }

    async fn list_non_healthy_states(&self) -> StoreResult<Vec<PairState>> {
        Ok(self
            .state
            .read()
            .await
            .pair_states
            .values()
            .filter(|s| !matches!(s.status, PairStatus::Healthy | PairStatus::Unknown))
            .cloned()
            .collect())
    }

    async fn states_for_target(&self, target_id: TargetId) -> StoreResult<Vec<PairState>> {
        Ok(self
            .state
            .read()
            .await
            .pair_states
            .values()
            .filter(|s| s.target_id == target_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: Alert, event: AlertEvent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.alerts.contains_key(&alert.id) {
            return Err(StoreError::Conflict(format!("alert {} exists", alert.id)));
        }
        state.alert_events.push(event);
        state.alerts.insert(alert.id, alert);
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert, event: Option<AlertEvent>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.alerts.contains_key(&alert.id) {
            return Err(StoreError::NotFound("alert"));
        }
        if let Some(event) = event {
            state.alert_events.push(event);
        }
        state.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        Ok(self.state.read().await.alerts.get(&id).cloned())
    }

    async fn list_alerts_with_status(&self, statuses: &[AlertStatus]) -> StoreResult<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| statuses.contains(&a.status))
            .cloned()
            .collect();
        alerts.sort_by_key(|a| std::cmp::Reverse(a.detected_at));
        Ok(alerts)
    }

    async fn find_active_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
    ) -> StoreResult<Option<Alert>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .values()
            .find(|a| {
                a.target_id == target_id
                    && a.alert_type == alert_type
                    && a.agent_id == agent_id
                    && a.status != AlertStatus::Resolved
            })
            .cloned())
    }

    async fn find_recently_resolved_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
        resolved_after: DateTime<Utc>,
    ) -> StoreResult<Option<Alert>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| {
                a.target_id == target_id
                    && a.alert_type == alert_type
                    && a.agent_id == agent_id
                    && a.status == AlertStatus::Resolved
                    && a.resolved_at.map(|at| at >= resolved_after).unwrap_or(false)
            })
            .max_by_key(|a| a.resolved_at)
            .cloned())
    }

    async fn unlinked_active_alerts(&self, since: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| {
                matches!(a.status, AlertStatus::Active | AlertStatus::Acknowledged)
                    && a.incident_id.is_none()
                    && a.last_updated_at >= since
            })
            .cloned()
            .collect())
    }

    async fn targets_with_active_alerts(&self) -> StoreResult<Vec<TargetId>> {
        let ids: HashSet<TargetId> = self
            .state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| matches!(a.status, AlertStatus::Active | AlertStatus::Acknowledged))
            .map(|a| a.target_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn alerts_for_target(
        &self,
        target_id: TargetId,
        statuses: &[AlertStatus],
    ) -> StoreResult<Vec<Alert>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| a.target_id == target_id && statuses.contains(&a.status))
            .cloned()
            .collect())
    }

    async fn alert_events(&self, alert_id: AlertId) -> StoreResult<Vec<AlertEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<AlertEvent> = state
            .alert_events
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn link_alert_to_incident(
        &self,
        alert_id: AlertId,
        incident_id: IncidentId,
        event: AlertEvent,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .get_mut(&alert_id)
            .ok_or(StoreError::NotFound("alert"))?;
        if alert.status == AlertStatus::Resolved {
            return Err(StoreError::Conflict(
                "cannot link a resolved alert".to_string(),
            ));
        }
        alert.incident_id = Some(incident_id);
        state.alert_events.push(event);
        Ok(())
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn create_incident_with_alerts(
        &self,
        incident: Incident,
        links: Vec<(AlertId, AlertEvent)>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.incidents.contains_key(&incident.id) {
            return Err(StoreError::Conflict(format!(
                "incident {} exists",
                incident.id
            )));
        }
        // Validate all links before mutating anything.
        for (alert_id, _) in &links {
            let alert = state
                .alerts
                .get(alert_id)
                .ok_or(StoreError::NotFound("alert"))?;
            if alert.status == AlertStatus::Resolved {
                return Err(StoreError::Conflict(
                    "cannot link a resolved alert".to_string(),
                ));
            }
        }
        for (alert_id, event) in links {
            let alert = state.alerts.get_mut(&alert_id).expect("validated above");
            alert.incident_id = Some(incident.id);
            state.alert_events.push(event);
        }
        state.incidents.insert(incident.id, incident);
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> StoreResult<Option<Incident>> {
        Ok(self.state.read().await.incidents.get(&id).cloned())
    }

    async fn list_incidents_with_status(
        &self,
        statuses: &[IncidentStatus],
    ) -> StoreResult<Vec<Incident>> {
        let mut incidents: Vec<Incident> = self
            .state
            .read()
            .await
            .incidents
            .values()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect();
        incidents.sort_by_key(|i| std::cmp::Reverse(i.detected_at));
        Ok(incidents)
    }

    async fn find_active_incident_by_correlation(
        &self,
        correlation_key: &str,
    ) -> StoreResult<Option<Incident>> {
        Ok(self
            .state
            .read()
            .await
            .incidents
            .values()
            .find(|i| {
                i.correlation_key == correlation_key && i.status != IncidentStatus::Resolved
            })
            .cloned())
    }

    async fn update_incident(&self, incident: &Incident) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.incidents.contains_key(&incident.id) {
            return Err(StoreError::NotFound("incident"));
        }
        state.incidents.insert(incident.id, incident.clone());
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn append_activity(&self, entry: ActivityEntry) -> StoreResult<()> {
        self.state.write().await.activity.push(entry);
        Ok(())
    }

    async fn list_activity(&self, filter: &ActivityFilter) -> StoreResult<Vec<ActivityEntry>> {
        let state = self.state.read().await;
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let mut entries: Vec<ActivityEntry> = state
            .activity
            .iter()
            .filter(|e| {
                filter.agent_id.map(|id| e.agent_id == Some(id)).unwrap_or(true)
                    && filter
                        .target_id
                        .map(|id| e.target_id == Some(id))
                        .unwrap_or(true)
                    && filter
                        .subnet_id
                        .map(|id| e.subnet_id == Some(id))
                        .unwrap_or(true)
                    && filter.ip.map(|ip| e.ip == Some(ip)).unwrap_or(true)
                    && filter
                        .category
                        .map(|c| e.category == c)
                        .unwrap_or(true)
                    && filter.since.map(|at| e.created_at >= at).unwrap_or(true)
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn prune_activity(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let old_len = state.activity.len();
        state.activity.retain(|e| e.created_at >= before);
        Ok((old_len - state.activity.len()) as u64)
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn create_command(&self, command: Command) -> StoreResult<()> {
        self.state.write().await.commands.insert(command.id, command);
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> StoreResult<Option<Command>> {
        Ok(self.state.read().await.commands.get(&id).cloned())
    }

    async fn pending_commands_for_agent(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Command>> {
        let state = self.state.read().await;
        Ok(state
            .commands
            .values()
            .filter(|c| {
                c.completed_at.is_none()
                    && c.expires_at > now
                    && (c.agent_ids.is_empty() || c.agent_ids.contains(&agent_id))
                    && !state.command_results.contains_key(&(c.id, agent_id))
            })
            .cloned()
            .collect())
    }

    async fn submit_command_result(&self, result: CommandResult) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.commands.contains_key(&result.command_id) {
            return Err(StoreError::NotFound("command"));
        }
        let key = (result.command_id, result.agent_id);
        if state.command_results.contains_key(&key) {
            return Ok(());
        }
        let submitted_at = result.submitted_at;
        state.command_results.insert(key, result);

        let successes = state
            .command_results
            .values()
            .filter(|r| r.command_id == key.0 && r.success)
            .count() as u32;
        let command = state.commands.get_mut(&key.0).expect("checked above");
        if command.completed_at.is_none() && successes >= command.quorum {
            command.completed_at = Some(submitted_at);
        }
        Ok(())
    }
}

#[async_trait]
impl AlertConfigStore for MemoryStore {
    async fn get_alert_config(&self) -> StoreResult<AlertConfig> {
        Ok(self.state.read().await.alert_config.clone())
    }

    async fn put_alert_config(&self, config: AlertConfig) -> StoreResult<()> {
        self.state.write().await.alert_config = config;
        Ok(())
    }
}
