//! # Fleet Registry
//!
//! Agent lifecycle: registration, heartbeats, archival and API keys.
//! Liveness status is never stored; it is recomputed from `last_heartbeat`
//! on every read, so scheduling decisions cannot act on a stale column.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use sentinel_store::{
    ActivityCategory, ActivityEntry, ActivitySeverity, ActivityStore, Agent, AgentId,
    AgentMetricsRow, AgentStatus, AgentStore, AssignmentStore, Command, CommandResult,
    CommandStore, HeartbeatPayload, Store, StoreError,
};

use crate::types::{
    AgentWithStatus, FleetConfig, FleetError, HeartbeatAck, RegisterRequest, RegisteredAgent,
};

const API_KEY_LEN: usize = 40;

pub struct FleetRegistry {
    store: Arc<dyn Store>,
    config: FleetConfig,
}

impl FleetRegistry {
    pub fn new(store: Arc<dyn Store>, config: FleetConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Register a new agent and issue its API key. The raw key is returned
    /// to the operator once and never persisted.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisteredAgent, FleetError> {
        if request.name.trim().is_empty() {
            return Err(FleetError::InvalidInput("agent name is required".into()));
        }
        let now = Utc::now();
        let api_key = generate_api_key();
        let api_key_hash = bcrypt::hash(&api_key, bcrypt::DEFAULT_COST)
            .map_err(|e| FleetError::Store(StoreError::Backend(e.to_string())))?;

        let agent = Agent {
            id: Uuid::new_v4(),
            name: request.name,
            region: request.region,
            provider: request.provider,
            location: request.location,
            public_ip: request.public_ip,
            capabilities: request.capabilities,
            max_targets: request.max_targets.unwrap_or(self.config.default_max_targets),
            version: request.version,
            tags: request.tags,
            api_key_hash: Some(api_key_hash),
            last_heartbeat: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_agent(agent.clone()).await?;
        self.log_fleet_event(agent.id, "agent_registered", "operator").await;
        info!(agent = %agent.name, region = %agent.region, "agent registered");
        Ok(RegisteredAgent { agent, api_key })
    }

    /// Record a heartbeat and return staleness plus pending commands.
    /// Heartbeats against archived agents are silently ignored.
    pub async fn heartbeat(
        &self,
        agent_id: AgentId,
        payload: HeartbeatPayload,
    ) -> Result<HeartbeatAck, FleetError> {
        let now = Utc::now();
        let metrics = AgentMetricsRow {
            time: now,
            agent_id,
            cpu_pct: payload.cpu_pct,
            memory_pct: payload.memory_pct,
            tasks: payload.tasks,
            active_targets: payload.active_targets,
            probes_per_second: payload.probes_per_second,
            results_queued: payload.results_queued,
            results_shipped: payload.results_shipped,
            assignment_version: payload.assignment_version,
        };
        let accepted = self.store.record_heartbeat(agent_id, now, metrics).await?;
        let current = self.store.current_assignment_version().await?;
        if !accepted {
            return Ok(HeartbeatAck {
                assignment_stale: false,
                assignment_version: current,
                commands: Vec::new(),
            });
        }

        let commands = self.store.pending_commands_for_agent(agent_id, now).await?;
        Ok(HeartbeatAck {
            assignment_stale: payload.assignment_version < current,
            assignment_version: current,
            commands,
        })
    }

    /// Archive an agent. Archiving an already-archived agent is a no-op.
    pub async fn archive(
        &self,
        agent_id: AgentId,
        reason: &str,
        triggered_by: &str,
    ) -> Result<(), FleetError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(StoreError::NotFound("agent"))?;
        if agent.archived_at.is_some() {
            return Ok(());
        }
        self.store
            .set_agent_archived(agent_id, Some(Utc::now()))
            .await?;
        // Its probing obligations disappear with it.
        let removed: Vec<_> = self
            .store
            .list_assignments_for_agent(agent_id)
            .await?
            .into_iter()
            .map(|a| (a.target_id, a.agent_id))
            .collect();
        if !removed.is_empty() {
            self.store
                .apply_assignment_diff(sentinel_store::AssignmentDiff {
                    added: Vec::new(),
                    removed,
                })
                .await?;
        }
        let mut entry = ActivityEntry::new(
            ActivityCategory::Fleet,
            "agent_archived",
            triggered_by,
            Utc::now(),
        );
        entry.agent_id = Some(agent_id);
        entry.details = serde_json::json!({ "reason": reason });
        self.append_activity(entry).await;
        info!(agent = %agent.name, reason, "agent archived");
        Ok(())
    }

    /// Unarchive; public fields are untouched, so archive→unarchive is a
    /// round trip.
    pub async fn unarchive(&self, agent_id: AgentId) -> Result<(), FleetError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(StoreError::NotFound("agent"))?;
        if agent.archived_at.is_none() {
            return Ok(());
        }
        self.store.set_agent_archived(agent_id, None).await?;
        self.log_fleet_event(agent_id, "agent_unarchived", "operator").await;
        Ok(())
    }

    /// Update public agent fields. Never touches `last_heartbeat`.
    pub async fn update_info(&self, agent: Agent) -> Result<(), FleetError> {
        self.store.update_agent(agent).await?;
        Ok(())
    }

    /// Rotate the agent's API key, returning the new raw key once.
    pub async fn issue_api_key(&self, agent_id: AgentId) -> Result<String, FleetError> {
        let api_key = generate_api_key();
        let hash = bcrypt::hash(&api_key, bcrypt::DEFAULT_COST)
            .map_err(|e| FleetError::Store(StoreError::Backend(e.to_string())))?;
        self.store.set_agent_api_key_hash(agent_id, Some(hash)).await?;
        self.log_fleet_event(agent_id, "api_key_issued", "operator").await;
        Ok(api_key)
    }

    pub async fn revoke_api_key(&self, agent_id: AgentId) -> Result<(), FleetError> {
        self.store.set_agent_api_key_hash(agent_id, None).await?;
        self.log_fleet_event(agent_id, "api_key_revoked", "operator").await;
        Ok(())
    }

    /// Verify a presented key against the stored hash. Archived agents and
    /// agents without a key always fail.
    pub async fn authenticate(
        &self,
        agent_id: AgentId,
        presented_key: &str,
    ) -> Result<Agent, FleetError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(FleetError::AuthFailed)?;
        if agent.archived_at.is_some() {
            return Err(FleetError::AuthFailed);
        }
        let hash = agent.api_key_hash.as_deref().ok_or(FleetError::AuthFailed)?;
        match bcrypt::verify(presented_key, hash) {
            Ok(true) => Ok(agent),
            _ => Err(FleetError::AuthFailed),
        }
    }

    /// All agents including archived, with computed status. Historical view.
    pub async fn list_all(&self) -> Result<Vec<AgentWithStatus>, FleetError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|agent| {
                let status = agent.status(now, self.config.liveness);
                AgentWithStatus {
                    agent,
                    status,
                    status_as_of: now,
                }
            })
            .collect())
    }

    /// Operational listing; excludes archived.
    pub async fn list_active(&self) -> Result<Vec<AgentWithStatus>, FleetError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_active_agents()
            .await?
            .into_iter()
            .map(|agent| {
                let status = agent.status(now, self.config.liveness);
                AgentWithStatus {
                    agent,
                    status,
                    status_as_of: now,
                }
            })
            .collect())
    }

    pub async fn get(&self, agent_id: AgentId) -> Result<Option<Agent>, FleetError> {
        Ok(self.store.get_agent(agent_id).await?)
    }

    /// Dispatch a command to some or all agents.
    pub async fn create_command(&self, command: Command) -> Result<(), FleetError> {
        if command.quorum < 1 {
            return Err(FleetError::InvalidInput("command quorum must be >= 1".into()));
        }
        self.store.create_command(command).await?;
        Ok(())
    }

    pub async fn submit_command_result(&self, result: CommandResult) -> Result<(), FleetError> {
        self.store.submit_command_result(result).await?;
        Ok(())
    }

    /// Compute the status an agent would report right now.
    pub fn status_of(&self, agent: &Agent) -> AgentStatus {
        agent.status(Utc::now(), self.config.liveness)
    }

    async fn log_fleet_event(&self, agent_id: AgentId, event_type: &str, triggered_by: &str) {
        let mut entry = ActivityEntry::new(
            ActivityCategory::Fleet,
            event_type,
            triggered_by,
            Utc::now(),
        );
        entry.agent_id = Some(agent_id);
        self.append_activity(entry).await;
    }

    // Activity logging is secondary to the state change; a failed append is
    // warned about and swallowed.
    async fn append_activity(&self, mut entry: ActivityEntry) {
        entry.severity = ActivitySeverity::Info;
        if let Err(e) = self.store.append_activity(entry).await {
            warn!(error = %e, "activity append failed");
        }
    }
}

fn generate_api_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect();
    format!("snt_{suffix}")
}
