//! # Store Contracts
//!
//! Transactional persistence contracts, grouped by concern. Workers and
//! request handlers only ever talk to `Arc<dyn Store>`; no in-memory entity
//! is authoritative across components.
//!
//! Failure mode for every method: the write is fully applied and visible, or
//! not at all. Reads never observe partial writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

use crate::query::{MetricsQuery, MetricsRow};
use crate::types::*;

/// Bulk pair operations are chunked at this size to stay under the 65 535
/// bind-parameter limit of the Postgres protocol (two parameters per pair).
pub const MAX_PAIRS_PER_BATCH: usize = 30_000;

#[async_trait]
pub trait AgentStore {
    async fn insert_agent(&self, agent: Agent) -> StoreResult<()>;

    /// Update public agent fields. Never touches `last_heartbeat`.
    async fn update_agent(&self, agent: Agent) -> StoreResult<()>;

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>>;
    async fn get_agent_by_name(&self, name: &str) -> StoreResult<Option<Agent>>;

    /// All agents including archived, for historical display.
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Operational listing; excludes archived.
    async fn list_active_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Advance the heartbeat timestamp (forward only) and append the
    /// agent-metrics sample in one transaction. Returns `false` when the
    /// agent is archived and the heartbeat was ignored.
    async fn record_heartbeat(
        &self,
        id: AgentId,
        at: DateTime<Utc>,
        metrics: AgentMetricsRow,
    ) -> StoreResult<bool>;

    async fn set_agent_archived(
        &self,
        id: AgentId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn set_agent_api_key_hash(&self, id: AgentId, hash: Option<String>) -> StoreResult<()>;

    async fn list_agent_metrics(
        &self,
        id: AgentId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AgentMetricsRow>>;
}

#[async_trait]
pub trait SubnetStore {
    /// Insert or update by id. Rejects CIDRs overlapping another active
    /// subnet of the same source.
    async fn upsert_subnet(&self, subnet: Subnet) -> StoreResult<()>;

    async fn get_subnet(&self, id: SubnetId) -> StoreResult<Option<Subnet>>;
    async fn list_subnets(&self) -> StoreResult<Vec<Subnet>>;
    async fn list_active_subnets(&self) -> StoreResult<Vec<Subnet>>;

    /// Longest-prefix containment lookup among non-archived subnets.
    async fn find_subnet_containing(&self, ip: Ipv4Addr) -> StoreResult<Option<Subnet>>;

    async fn set_subnet_service_status(
        &self,
        id: SubnetId,
        status: SubnetServiceStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn set_subnet_archived(
        &self,
        id: SubnetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait TargetStore {
    /// Insert a target; rejects a duplicate IP among active targets.
    async fn insert_target(&self, target: Target) -> StoreResult<()>;

    /// Update target fields other than `monitoring_state` (state changes go
    /// through `transition_target_state` so history stays consistent).
    async fn update_target(&self, target: Target) -> StoreResult<()>;

    async fn get_target(&self, id: TargetId) -> StoreResult<Option<Target>>;
    async fn get_target_by_ip(&self, ip: Ipv4Addr) -> StoreResult<Option<Target>>;
    async fn list_targets(&self) -> StoreResult<Vec<Target>>;
    async fn list_targets_in_states(
        &self,
        states: &[MonitoringState],
    ) -> StoreResult<Vec<Target>>;
    async fn list_targets_in_subnet(&self, subnet_id: SubnetId) -> StoreResult<Vec<Target>>;

    async fn set_target_archived(
        &self,
        id: TargetId,
        archived_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Move a target to `new_state`, writing the `target_state_history` row
    /// and the activity entry in the same transaction. Returns the updated
    /// target. A no-op transition (same state) returns the target unchanged
    /// without writing history.
    async fn transition_target_state(
        &self,
        id: TargetId,
        new_state: MonitoringState,
        reason: &str,
        triggered_by: &str,
        needs_review: Option<bool>,
    ) -> StoreResult<Target>;

    /// Transition every target of the subnet currently in `from_states` to
    /// `new_state` in one transaction: one history row per target, one
    /// subnet-level activity entry. Returns the affected target ids.
    async fn transition_targets_in_subnet(
        &self,
        subnet_id: SubnetId,
        from_states: &[MonitoringState],
        new_state: MonitoringState,
        reason: &str,
        triggered_by: &str,
    ) -> StoreResult<Vec<TargetId>>;

    /// Apply evaluator response-timestamp touches in bulk. `responded_at`
    /// advances `last_response_at` (and `first_response_at` when unset);
    /// `baseline_established_at` is only written when currently unset.
    async fn bulk_touch_target_responses(
        &self,
        touches: Vec<TargetResponseTouch>,
    ) -> StoreResult<()>;

    /// Elect `target_id` as its subnet's representative, clearing the flag
    /// on every other target of the subnet in the same transaction.
    async fn set_representative(&self, subnet_id: SubnetId, target_id: TargetId)
        -> StoreResult<()>;

    /// Standby customer targets of the subnet with an established baseline,
    /// ordered by baseline age descending (oldest first).
    async fn list_representative_candidates(
        &self,
        subnet_id: SubnetId,
    ) -> StoreResult<Vec<Target>>;

    async fn target_state_history(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> StoreResult<Vec<TargetStateHistory>>;

    // Lifecycle worker scans. Each returns non-archived targets matching the
    // transition predicate; thresholds come from the caller's config.

    /// Degraded targets with an established baseline whose last response is
    /// older than `down_after`.
    async fn targets_eligible_for_down(
        &self,
        now: DateTime<Utc>,
        down_after: chrono::Duration,
    ) -> StoreResult<Vec<Target>>;

    /// Unknown targets never observed, older than `unresponsive_after`.
    async fn targets_eligible_for_unresponsive(
        &self,
        now: DateTime<Utc>,
        unresponsive_after: chrono::Duration,
    ) -> StoreResult<Vec<Target>>;

    /// Down targets that have been down longer than `exclude_after`.
    async fn targets_eligible_for_excluded(
        &self,
        now: DateTime<Utc>,
        exclude_after: chrono::Duration,
    ) -> StoreResult<Vec<Target>>;

    /// Unresponsive/excluded targets whose subnet has zero active customer
    /// targets, i.e. the only candidates worth re-checking.
    async fn targets_for_smart_recheck(&self) -> StoreResult<Vec<Target>>;
}

#[async_trait]
pub trait TierStore {
    async fn upsert_tier(&self, tier: Tier) -> StoreResult<()>;
    async fn get_tier(&self, name: &str) -> StoreResult<Option<Tier>>;
    async fn list_tiers(&self) -> StoreResult<Vec<Tier>>;
    async fn delete_tier(&self, name: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait AssignmentStore {
    async fn list_assignments(&self) -> StoreResult<Vec<Assignment>>;
    async fn list_assignments_for_agent(&self, agent_id: AgentId) -> StoreResult<Vec<Assignment>>;
    async fn agents_assigned_to_target(&self, target_id: TargetId) -> StoreResult<Vec<AgentId>>;

    /// Apply a non-empty diff: per changed target, inserts and deletes are
    /// one transactional unit; the version counter is incremented exactly
    /// once at the end and the change journal extended. Returns the new
    /// version. Callers must not submit an empty diff.
    async fn apply_assignment_diff(&self, diff: AssignmentDiff) -> StoreResult<u64>;

    async fn current_assignment_version(&self) -> StoreResult<u64>;

    /// Journal entries for this agent strictly after `from_version`, or
    /// `None` when `from_version` precedes the journal horizon (caller
    /// falls back to a full set).
    async fn assignment_changes_since(
        &self,
        agent_id: AgentId,
        from_version: u64,
    ) -> StoreResult<Option<Vec<AssignmentChange>>>;

    /// Bootstrap path: drop every assignment row and the journal. The
    /// version counter is preserved (it only ever moves forward).
    async fn delete_all_assignments(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait ResultStore {
    /// Stage, enrich (agent_region / target_region / is_in_market via joins
    /// against agents and subnets) and insert, discarding duplicates on
    /// (time, target, agent). Returns the number of rows actually inserted.
    async fn bulk_insert_results(&self, results: Vec<ProbeResult>) -> StoreResult<u64>;

    /// Every (agent, target) pair with at least one result since
    /// `window_start`, joined against non-archived agents and targets.
    async fn active_pairs_since(&self, window_start: DateTime<Utc>) -> StoreResult<Vec<PairKey>>;

    /// Window statistics per pair, internally chunked at
    /// [`MAX_PAIRS_PER_BATCH`]. Pairs without samples are omitted.
    async fn bulk_pair_window_stats(
        &self,
        pairs: &[PairKey],
        window_start: DateTime<Utc>,
    ) -> StoreResult<Vec<PairWindowStats>>;

    /// Raw samples for baseline recalculation over `[since, now)`.
    async fn pair_baseline_samples(
        &self,
        pair: PairKey,
        since: DateTime<Utc>,
    ) -> StoreResult<BaselineSamples>;

    /// Raw result rows for a target, newest first. Operator debugging and
    /// in-market inspection path.
    async fn list_results_for_target(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ProbeResult>>;

    /// Compiled metrics query over the appropriate aggregate level.
    async fn metrics_query(&self, query: &MetricsQuery) -> StoreResult<Vec<MetricsRow>>;

    /// Retention sweep; deletes raw results older than `before`.
    async fn prune_results(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait BaselineStore {
    async fn get_baseline(&self, pair: PairKey) -> StoreResult<Option<PairBaseline>>;
    async fn bulk_get_baselines(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairBaseline>>;
    async fn bulk_upsert_baselines(&self, baselines: Vec<PairBaseline>) -> StoreResult<()>;
    async fn delete_baselines_for_target(&self, target_id: TargetId) -> StoreResult<()>;
}

#[async_trait]
pub trait PairStateStore {
    async fn get_pair_state(&self, pair: PairKey) -> StoreResult<Option<PairState>>;
    async fn bulk_get_pair_states(&self, pairs: &[PairKey]) -> StoreResult<Vec<PairState>>;

    /// Last-writer-wins upsert; the evaluator is the only writer in normal
    /// operation.
    async fn bulk_upsert_pair_states(&self, states: Vec<PairState>) -> StoreResult<()>;

    /// Pairs currently not healthy, for the alert worker.
    async fn list_non_healthy_states(&self) -> StoreResult<Vec<PairState>>;

    /// All pair states observing a target.
    async fn states_for_target(&self, target_id: TargetId) -> StoreResult<Vec<PairState>>;
}

#[async_trait]
pub trait AlertStore {
    /// Insert the alert head row and its `created` event atomically.
    async fn create_alert(&self, alert: Alert, event: AlertEvent) -> StoreResult<()>;

    /// Update the head row and, when present, append the event row in the
    /// same transaction. Alert-event appends are never swallowed: head and
    /// event commit together or not at all.
    async fn update_alert(&self, alert: &Alert, event: Option<AlertEvent>) -> StoreResult<()>;

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>>;
    async fn list_alerts_with_status(&self, statuses: &[AlertStatus]) -> StoreResult<Vec<Alert>>;

    /// The non-resolved alert for this (target, type, agent) triple, if any.
    async fn find_active_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
    ) -> StoreResult<Option<Alert>>;

    /// Most recently resolved alert for the triple, for the reopen window.
    async fn find_recently_resolved_alert(
        &self,
        target_id: TargetId,
        alert_type: AlertType,
        agent_id: Option<AgentId>,
        resolved_after: DateTime<Utc>,
    ) -> StoreResult<Option<Alert>>;

    /// Active/acknowledged alerts not yet linked to an incident.
    async fn unlinked_active_alerts(&self, since: DateTime<Utc>) -> StoreResult<Vec<Alert>>;

    /// Distinct targets having at least one active/acknowledged alert.
    async fn targets_with_active_alerts(&self) -> StoreResult<Vec<TargetId>>;

    async fn alerts_for_target(
        &self,
        target_id: TargetId,
        statuses: &[AlertStatus],
    ) -> StoreResult<Vec<Alert>>;

    async fn alert_events(&self, alert_id: AlertId) -> StoreResult<Vec<AlertEvent>>;

    /// Link the alert to an incident, appending the `linked_to_incident`
    /// event in the same transaction.
    async fn link_alert_to_incident(
        &self,
        alert_id: AlertId,
        incident_id: IncidentId,
        event: AlertEvent,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait IncidentStore {
    /// Create the incident and link the member alerts (with their events)
    /// in one transaction.
    async fn create_incident_with_alerts(
        &self,
        incident: Incident,
        links: Vec<(AlertId, AlertEvent)>,
    ) -> StoreResult<()>;

    async fn get_incident(&self, id: IncidentId) -> StoreResult<Option<Incident>>;
    async fn list_incidents_with_status(
        &self,
        statuses: &[IncidentStatus],
    ) -> StoreResult<Vec<Incident>>;

    async fn find_active_incident_by_correlation(
        &self,
        correlation_key: &str,
    ) -> StoreResult<Option<Incident>>;

    async fn update_incident(&self, incident: &Incident) -> StoreResult<()>;
}

#[async_trait]
pub trait ActivityStore {
    async fn append_activity(&self, entry: ActivityEntry) -> StoreResult<()>;
    async fn list_activity(&self, filter: &ActivityFilter) -> StoreResult<Vec<ActivityEntry>>;
    async fn prune_activity(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait CommandStore {
    async fn create_command(&self, command: Command) -> StoreResult<()>;
    async fn get_command(&self, id: CommandId) -> StoreResult<Option<Command>>;

    /// Unexpired, incomplete commands addressed to this agent (or
    /// fleet-wide) that it has not yet answered.
    async fn pending_commands_for_agent(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Command>>;

    /// Record the result; marks the command complete once the success
    /// quorum is reached. Resubmission by the same agent is a no-op.
    async fn submit_command_result(&self, result: CommandResult) -> StoreResult<()>;
}

#[async_trait]
pub trait AlertConfigStore {
    async fn get_alert_config(&self) -> StoreResult<AlertConfig>;
    async fn put_alert_config(&self, config: AlertConfig) -> StoreResult<()>;
}

/// Umbrella contract implemented by every backend.
pub trait Store:
    AgentStore
    + SubnetStore
    + TargetStore
    + TierStore
    + AssignmentStore
    + ResultStore
    + BaselineStore
    + PairStateStore
    + AlertStore
    + IncidentStore
    + ActivityStore
    + CommandStore
    + AlertConfigStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: AgentStore
        + SubnetStore
        + TargetStore
        + TierStore
        + AssignmentStore
        + ResultStore
        + BaselineStore
        + PairStateStore
        + AlertStore
        + IncidentStore
        + ActivityStore
        + CommandStore
        + AlertConfigStore
        + Send
        + Sync
{
}

/// Split a pair list into protocol-safe chunks. Exactly
/// [`MAX_PAIRS_PER_BATCH`] pairs stay a single batch; one more splits.
pub fn chunk_pairs(pairs: &[PairKey]) -> impl Iterator<Item = &[PairKey]> {
    pairs.chunks(MAX_PAIRS_PER_BATCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pair() -> PairKey {
        PairKey {
            agent_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn pair_chunking_boundary() {
        let pairs: Vec<PairKey> = (0..MAX_PAIRS_PER_BATCH).map(|_| pair()).collect();
        assert_eq!(chunk_pairs(&pairs).count(), 1);

        let pairs: Vec<PairKey> = (0..MAX_PAIRS_PER_BATCH + 1).map(|_| pair()).collect();
        assert_eq!(chunk_pairs(&pairs).count(), 2);
    }
}
