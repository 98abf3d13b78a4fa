//! # Core Entity Model
//!
//! This module defines the entities shared by every control-plane component:
//! agents, subnets, targets, tiers, assignments, probe results, per-pair
//! baselines and states, alerts, incidents, commands and the activity log.
//! The store traits in [`crate::store`] operate exclusively on these types.

use chrono::{DateTime, Duration, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a probing agent
pub type AgentId = Uuid;

/// Unique identifier for a monitored target
pub type TargetId = Uuid;

/// Unique identifier for a subnet
pub type SubnetId = Uuid;

/// Unique identifier for an alert
pub type AlertId = Uuid;

/// Unique identifier for an incident
pub type IncidentId = Uuid;

/// Unique identifier for a fleet command
pub type CommandId = Uuid;

/// Store error taxonomy.
///
/// `Unavailable` is the only retryable class; workers re-queue with backoff,
/// request handlers translate it to a retryable response.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the caller may retry the operation after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result alias used throughout the store layer
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Probe types an agent can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Icmp,
    Mtr,
    Tcp,
}

/// A remote probing process.
///
/// `last_heartbeat` is only ever written by the heartbeat path, and only
/// forward in time. Liveness status is never stored; it is recomputed from
/// timestamps on every read (see [`Agent::status`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub region: String,
    pub provider: String,
    pub location: String,
    /// Public network identity as reported at registration
    pub public_ip: Option<Ipv4Addr>,
    pub capabilities: Vec<ProbeKind>,
    /// Capacity ceiling for the assignment engine
    pub max_targets: u32,
    /// Agent software version string
    pub version: String,
    pub tags: HashMap<String, String>,
    /// bcrypt hash of the current API key; the raw key is never stored
    #[serde(skip_serializing, default)]
    pub api_key_hash: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Computed agent liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Degraded,
    Offline,
    Archived,
}

/// Heartbeat freshness thresholds (seconds)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LivenessThresholds {
    pub active_secs: i64,
    pub offline_secs: i64,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            active_secs: 30,
            offline_secs: 60,
        }
    }
}

impl Agent {
    /// Compute liveness status from timestamps. `archived_at` overrides
    /// heartbeat freshness regardless of age.
    pub fn status(&self, now: DateTime<Utc>, thresholds: LivenessThresholds) -> AgentStatus {
        if self.archived_at.is_some() {
            return AgentStatus::Archived;
        }
        match self.last_heartbeat {
            None => AgentStatus::Offline,
            Some(hb) => {
                let age = now - hb;
                if age <= Duration::seconds(thresholds.active_secs) {
                    AgentStatus::Active
                } else if age <= Duration::seconds(thresholds.offline_secs) {
                    AgentStatus::Degraded
                } else {
                    AgentStatus::Offline
                }
            }
        }
    }
}

/// One time-series sample of agent-reported health, appended per heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricsRow {
    pub time: DateTime<Utc>,
    pub agent_id: AgentId,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub tasks: u32,
    pub active_targets: u32,
    pub probes_per_second: f64,
    pub results_queued: u64,
    pub results_shipped: u64,
    /// Assignment version the agent last observed
    pub assignment_version: u64,
}

// ---------------------------------------------------------------------------
// Subnets
// ---------------------------------------------------------------------------

/// External service status of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetServiceStatus {
    Active,
    Suspended,
    Cancelled,
}

/// A CIDR block with enrichment metadata, synced from an external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub cidr: Ipv4Net,
    /// External sync source; active subnets of the same source must not overlap
    pub source: String,
    pub subscriber: Option<String>,
    pub service: Option<String>,
    pub location: Option<String>,
    pub pop: Option<String>,
    pub gateway_device: Option<String>,
    pub region: Option<String>,
    pub vlan: Option<i32>,
    pub service_status: SubnetServiceStatus,
    pub service_status_changed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subnet {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Whether a target follows its subnet's lifecycle or is pinned by a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Auto,
    Manual,
}

/// How the target entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOrigin {
    Sync,
    Discovery,
    User,
}

/// Role of the IP within the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpType {
    Customer,
    Gateway,
    Infrastructure,
}

/// Target monitoring state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringState {
    Unknown,
    Active,
    Degraded,
    Down,
    Unresponsive,
    Excluded,
    Inactive,
    Standby,
}

impl MonitoringState {
    /// States that participate in regular assignment
    pub fn is_probeable(&self) -> bool {
        matches!(
            self,
            MonitoringState::Active | MonitoringState::Degraded | MonitoringState::Down
        )
    }

    /// States in which anomalies may raise alerts
    pub fn is_alertable(&self) -> bool {
        matches!(
            self,
            MonitoringState::Active | MonitoringState::Degraded | MonitoringState::Down
        )
    }
}

/// Expected probe outcome override for intentionally-silent targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub should_succeed: bool,
    pub severity: AlertSeverity,
}

/// A single IPv4 address under monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub ip: Ipv4Addr,
    pub tier: String,
    pub ownership: Ownership,
    pub origin: TargetOrigin,
    pub ip_type: IpType,
    pub monitoring_state: MonitoringState,
    /// When the current monitoring state was entered
    pub state_changed_at: DateTime<Utc>,
    pub subnet_id: Option<SubnetId>,
    /// The single target per subnet elected as its health proxy
    pub is_representative: bool,
    pub needs_review: bool,
    pub first_response_at: Option<DateTime<Utc>>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub baseline_established_at: Option<DateTime<Utc>>,
    pub expected_outcome: Option<ExpectedOutcome>,
    pub tags: HashMap<String, String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only target state history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStateHistory {
    pub id: Uuid,
    pub target_id: TargetId,
    pub old_state: MonitoringState,
    pub new_state: MonitoringState,
    pub reason: String,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
}

/// Response-timestamp touch applied by the evaluator after a pass
#[derive(Debug, Clone)]
pub struct TargetResponseTouch {
    pub target_id: TargetId,
    pub responded_at: Option<DateTime<Utc>>,
    pub baseline_established_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tiers
// ---------------------------------------------------------------------------

/// Agent selection strategy for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    All,
    Distributed,
}

/// Policy describing which agents probe a tier's targets.
///
/// `Distributed` requires `count >= 1`. Empty include lists mean "no
/// restriction"; exclude lists always apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSelectionPolicy {
    pub strategy: SelectionStrategy,
    pub count: Option<u32>,
    pub include_regions: Vec<String>,
    pub exclude_regions: Vec<String>,
    pub include_providers: Vec<String>,
    pub exclude_providers: Vec<String>,
    pub required_tags: HashMap<String, String>,
    pub excluded_tags: HashMap<String, String>,
    pub min_regions: u32,
    pub min_providers: u32,
}

impl AgentSelectionPolicy {
    pub fn all() -> Self {
        Self {
            strategy: SelectionStrategy::All,
            count: None,
            include_regions: Vec::new(),
            exclude_regions: Vec::new(),
            include_providers: Vec::new(),
            exclude_providers: Vec::new(),
            required_tags: HashMap::new(),
            excluded_tags: HashMap::new(),
            min_regions: 0,
            min_providers: 0,
        }
    }

    pub fn distributed(count: u32) -> Self {
        Self {
            strategy: SelectionStrategy::Distributed,
            count: Some(count),
            ..Self::all()
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.strategy == SelectionStrategy::Distributed && self.count.unwrap_or(0) < 1 {
            return Err(StoreError::InvalidInput(
                "distributed selection requires count >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Monitoring policy class assigned to targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub probe_interval_secs: u32,
    pub timeout_ms: u32,
    pub retries: u32,
    pub selection: AgentSelectionPolicy,
    pub default_expected_outcome: Option<ExpectedOutcome>,
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// A (target, agent) probing obligation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub target_id: TargetId,
    pub agent_id: AgentId,
    pub tier: String,
}

/// Differential produced by one assignment engine run
#[derive(Debug, Clone, Default)]
pub struct AssignmentDiff {
    pub added: Vec<Assignment>,
    pub removed: Vec<(TargetId, AgentId)>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Full assignment set for one agent at a given version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentSet {
    pub version: u64,
    pub assignments: Vec<Assignment>,
}

/// One journal entry of the assignment change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentChange {
    pub version: u64,
    pub target_id: TargetId,
    pub agent_id: AgentId,
    pub op: AssignmentOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOp {
    Add,
    Remove,
}

/// Delta between an agent's last seen version and the current one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentDelta {
    pub from_version: u64,
    pub to_version: u64,
    pub added: Vec<Assignment>,
    pub removed: Vec<(TargetId, AgentId)>,
}

/// Reply to an agent's assignment fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssignmentFetch {
    UpToDate { version: u64 },
    Delta(AssignmentDelta),
    Full(AssignmentSet),
}

// ---------------------------------------------------------------------------
// Probe results
// ---------------------------------------------------------------------------

/// One probe observation shipped by an agent.
///
/// `agent_region`, `target_region` and `is_in_market` are derived at insert
/// time from the agents and subnets tables; agents never set them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub time: DateTime<Utc>,
    pub target_id: TargetId,
    pub agent_id: AgentId,
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    /// Probe-type specific payload, opaque to the control plane
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub agent_region: Option<String>,
    #[serde(default)]
    pub target_region: Option<String>,
    #[serde(default)]
    pub is_in_market: bool,
}

/// A batch of results shipped by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBatch {
    pub agent_id: AgentId,
    pub batch_id: Uuid,
    pub results: Vec<ProbeResult>,
}

/// Key of a monitored (agent, target) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub agent_id: AgentId,
    pub target_id: TargetId,
}

/// Aggregated probe statistics for a pair over a recent window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairWindowStats {
    pub agent_id: AgentId,
    pub target_id: TargetId,
    pub sample_count: u64,
    pub success_count: u64,
    pub avg_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
}

impl PairWindowStats {
    pub fn key(&self) -> PairKey {
        PairKey {
            agent_id: self.agent_id,
            target_id: self.target_id,
        }
    }
}

/// Raw samples for a baseline recalculation window
#[derive(Debug, Clone, Default)]
pub struct BaselineSamples {
    pub latencies_ms: Vec<f64>,
    pub loss_values_pct: Vec<f64>,
    pub success_count: u64,
    pub total_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Baselines and pair state
// ---------------------------------------------------------------------------

/// Empirical distribution summary of probe metrics for a pair.
///
/// Valid only once `sample_count` reaches the configured minimum; below it
/// the evaluator falls back to absolute thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairBaseline {
    pub agent_id: AgentId,
    pub target_id: TargetId,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub latency_stddev: f64,
    pub packet_loss_baseline: f64,
    pub sample_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PairBaseline {
    pub fn key(&self) -> PairKey {
        PairKey {
            agent_id: self.agent_id,
            target_id: self.target_id,
        }
    }
}

/// Health of one (agent, target) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Unknown,
    Healthy,
    Degraded,
    Down,
}

/// Evaluator-owned state for a pair.
///
/// Invariant: `anomaly_start` is `Some` iff `status != Healthy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    pub agent_id: AgentId,
    pub target_id: TargetId,
    pub status: PairStatus,
    pub status_since: DateTime<Utc>,
    pub current_z_score: Option<f64>,
    pub current_packet_loss: f64,
    pub current_latency_ms: Option<f64>,
    pub anomaly_start: Option<DateTime<Utc>>,
    pub consecutive_anomalies: u32,
    pub consecutive_successes: u32,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub last_evaluated: DateTime<Utc>,
}

impl PairState {
    pub fn key(&self) -> PairKey {
        PairKey {
            agent_id: self.agent_id,
            target_id: self.target_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Alert severity, ordered info < warning < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn rank(&self) -> u8 {
        match self {
            AlertSeverity::Info => 1,
            AlertSeverity::Warning => 2,
            AlertSeverity::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LatencyAnomaly,
    PacketLoss,
    TargetDown,
    UnexpectedState,
}

/// Observed metrics captured on an alert at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertMetrics {
    pub z_score: Option<f64>,
    pub latency_ms: Option<f64>,
    pub packet_loss_pct: f64,
}

/// Denormalized enrichment copied onto the alert at creation for historical
/// fidelity; later subnet edits do not rewrite past alerts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertEnrichment {
    pub subnet_id: Option<SubnetId>,
    pub subnet_cidr: Option<String>,
    pub subscriber: Option<String>,
    pub pop: Option<String>,
    pub gateway_device: Option<String>,
    pub location: Option<String>,
    pub region: Option<String>,
}

/// An evolving record of an anomaly stream.
///
/// Invariants: `peak_severity >= initial_severity`, `peak_severity >=
/// severity`; `status == Resolved` implies `resolved_at` is set; reopening
/// preserves the id and appends a `reopened` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub target_id: TargetId,
    /// `None` marks a consensus alert raised across multiple agents
    pub agent_id: Option<AgentId>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub initial_severity: AlertSeverity,
    pub peak_severity: AlertSeverity,
    pub status: AlertStatus,
    pub metrics: AlertMetrics,
    pub initial_metrics: AlertMetrics,
    pub peak_metrics: AlertMetrics,
    pub detected_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub correlation_key: String,
    pub incident_id: Option<IncidentId>,
    pub enrichment: AlertEnrichment,
    /// Timestamp of the last escalation, used by the de-escalation window
    pub last_escalated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventType {
    Created,
    Escalated,
    DeEscalated,
    Acknowledged,
    Unacknowledged,
    LinkedToIncident,
    MetricsUpdated,
    Resolved,
    Reopened,
}

/// Immutable entry in an alert's history; never mutated or deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub alert_id: AlertId,
    pub event_type: AlertEventType,
    pub old_severity: Option<AlertSeverity>,
    pub new_severity: Option<AlertSeverity>,
    pub old_status: Option<AlertStatus>,
    pub new_status: Option<AlertStatus>,
    pub metrics: Option<AlertMetrics>,
    pub description: String,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    /// Minimal event constructor; optional fields start empty.
    pub fn new(
        alert_id: AlertId,
        event_type: AlertEventType,
        description: impl Into<String>,
        triggered_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id,
            event_type,
            old_severity: None,
            new_severity: None,
            old_status: None,
            new_status: None,
            metrics: None,
            description: description.into(),
            triggered_by: triggered_by.into(),
            created_at: at,
        }
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    Target,
    Agent,
    Regional,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    Active,
    Acknowledged,
    Resolved,
}

/// A correlated group of concurrent alerts sharing a dimension.
///
/// Once `Resolved`, no further alerts are linked; a new correlated burst
/// under the same key creates a new incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub correlation_key: String,
    pub incident_type: IncidentType,
    pub severity: AlertSeverity,
    pub status: IncidentStatus,
    pub affected_target_ids: Vec<TargetId>,
    pub affected_agent_ids: Vec<AgentId>,
    pub alert_count: u32,
    pub peak_alert_count: u32,
    pub peak_severity: AlertSeverity,
    pub detected_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Fleet,
    Target,
    Subnet,
    Assignment,
    Alerting,
    Incident,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySeverity {
    Info,
    Warning,
    Critical,
}

/// One row of the unified append-only activity log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub target_id: Option<TargetId>,
    pub subnet_id: Option<SubnetId>,
    pub agent_id: Option<AgentId>,
    pub ip: Option<Ipv4Addr>,
    pub category: ActivityCategory,
    pub event_type: String,
    pub details: serde_json::Value,
    pub triggered_by: String,
    pub severity: ActivitySeverity,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        category: ActivityCategory,
        event_type: impl Into<String>,
        triggered_by: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: None,
            subnet_id: None,
            agent_id: None,
            ip: None,
            category,
            event_type: event_type.into(),
            details: serde_json::Value::Null,
            triggered_by: triggered_by.into(),
            severity: ActivitySeverity::Info,
            created_at: at,
        }
    }
}

/// Query filter over the activity log
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub agent_id: Option<AgentId>,
    pub target_id: Option<TargetId>,
    pub subnet_id: Option<SubnetId>,
    pub ip: Option<Ipv4Addr>,
    pub category: Option<ActivityCategory>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// An operator instruction dispatched to some or all agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub command: String,
    pub payload: serde_json::Value,
    /// Empty means fleet-wide
    pub agent_ids: Vec<AgentId>,
    /// Number of successful results required to mark the command complete
    pub quorum: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One agent's execution result for a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub success: bool,
    pub output: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alert configuration
// ---------------------------------------------------------------------------

/// Tunable evaluation and alerting thresholds, stored as a single row and
/// re-read by the workers each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub zscore_threshold: f64,
    pub abs_latency_ms: f64,
    pub abs_loss_pct: f64,
    /// Minimum samples before a baseline is considered valid
    pub baseline_min_samples: u64,
    pub consecutive_failures: u32,
    pub consecutive_recoveries: u32,
    pub down_after_secs: i64,
    pub de_escalation_window_secs: i64,
    pub reopen_window_secs: i64,
    pub metric_update_debounce_secs: i64,
    /// Default healthy-agent quorum for auto-resolve; tier overrides apply
    pub auto_resolve_min_healthy: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            zscore_threshold: 3.0,
            abs_latency_ms: 500.0,
            abs_loss_pct: 5.0,
            baseline_min_samples: 100,
            consecutive_failures: 3,
            consecutive_recoveries: 3,
            down_after_secs: 600, // 10 minutes
            de_escalation_window_secs: 300,
            reopen_window_secs: 300,
            metric_update_debounce_secs: 60,
            auto_resolve_min_healthy: 2,
        }
    }
}

/// Heartbeat payload reported by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: String,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub tasks: u32,
    pub active_targets: u32,
    pub probes_per_second: f64,
    pub results_queued: u64,
    pub results_shipped: u64,
    pub assignment_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_heartbeat(age_secs: i64, now: DateTime<Utc>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "probe-1".to_string(),
            region: "ord".to_string(),
            provider: "colo".to_string(),
            location: "chicago".to_string(),
            public_ip: None,
            capabilities: vec![ProbeKind::Icmp],
            max_targets: 1000,
            version: "1.0.0".to_string(),
            tags: HashMap::new(),
            api_key_hash: None,
            last_heartbeat: Some(now - Duration::seconds(age_secs)),
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn agent_status_from_heartbeat_age() {
        let now = Utc::now();
        let thresholds = LivenessThresholds::default();

        assert_eq!(
            agent_with_heartbeat(5, now).status(now, thresholds),
            AgentStatus::Active
        );
        assert_eq!(
            agent_with_heartbeat(45, now).status(now, thresholds),
            AgentStatus::Degraded
        );
        assert_eq!(
            agent_with_heartbeat(120, now).status(now, thresholds),
            AgentStatus::Offline
        );
    }

    #[test]
    fn archived_overrides_fresh_heartbeat() {
        let now = Utc::now();
        let mut agent = agent_with_heartbeat(1, now);
        agent.archived_at = Some(now);
        assert_eq!(
            agent.status(now, LivenessThresholds::default()),
            AgentStatus::Archived
        );
    }

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
        assert_eq!(AlertSeverity::Critical.rank(), 3);
    }

    #[test]
    fn distributed_policy_requires_count() {
        let mut policy = AgentSelectionPolicy::distributed(3);
        assert!(policy.validate().is_ok());
        policy.count = None;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Unavailable("pool exhausted".into()).is_retryable());
        assert!(!StoreError::NotFound("agent").is_retryable());
        assert!(!StoreError::Conflict("dup".into()).is_retryable());
    }
}
