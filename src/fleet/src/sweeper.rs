//! # Status Sweeper
//!
//! Observes computed liveness transitions (active ↔ degraded ↔ offline) and
//! records them in the activity log. Informational only: the scheduler
//! never reads stored status, so a missed sweep costs nothing but an audit
//! entry.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sentinel_store::{
    ActivityCategory, ActivityEntry, ActivitySeverity, ActivityStore, AgentId, AgentStatus,
    AgentStore, Store,
};

use crate::types::{FleetConfig, FleetError};

pub async fn run_status_sweeper(
    store: Arc<dyn Store>,
    config: FleetConfig,
    token: CancellationToken,
) -> Result<(), FleetError> {
    let mut tick = interval(Duration::from_secs(config.sweep_interval_secs));
    let mut observed: HashMap<AgentId, AgentStatus> = HashMap::new();
    info!(
        interval_secs = config.sweep_interval_secs,
        "fleet status sweeper started"
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = sweep_once(store.as_ref(), &config, &mut observed).await {
            warn!(error = %e, "status sweep failed");
        }
    }
    info!("fleet status sweeper stopped");
    Ok(())
}

pub async fn sweep_once(
    store: &dyn Store,
    config: &FleetConfig,
    observed: &mut HashMap<AgentId, AgentStatus>,
) -> Result<usize, FleetError> {
    let now = Utc::now();
    let agents = store.list_active_agents().await?;
    let mut transitions = 0;

    for agent in &agents {
        let status = agent.status(now, config.liveness);
        let previous = observed.insert(agent.id, status);
        let Some(previous) = previous else { continue };
        if previous == status {
            continue;
        }
        transitions += 1;

        let severity = match status {
            AgentStatus::Offline => ActivitySeverity::Warning,
            _ => ActivitySeverity::Info,
        };
        let mut entry = ActivityEntry::new(
            ActivityCategory::Fleet,
            "agent_status_changed",
            "fleet_sweeper",
            now,
        );
        entry.agent_id = Some(agent.id);
        entry.severity = severity;
        entry.details = serde_json::json!({
            "agent": agent.name,
            "old_status": previous,
            "new_status": status,
        });
        if let Err(e) = store.append_activity(entry).await {
            warn!(error = %e, "activity append failed");
        }
    }

    observed.retain(|id, _| agents.iter().any(|a| a.id == *id));
    Ok(transitions)
}
