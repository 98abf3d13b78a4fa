//! # Assignment Engine
//!
//! Periodic full replan: gathers live agents, probeable targets (plus the
//! discovery / re-check / slow coverage sets), resolves tier policies and
//! writes the differential against the current assignment table. An empty
//! diff is a strict no-op: no store write, no version bump.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_store::{
    ActivityCategory, ActivityEntry, ActivitySeverity, ActivityStore, AgentStatus, AgentStore,
    Assignment, AssignmentDiff, AssignmentStore, LivenessThresholds, MonitoringState, Store,
    Target, TargetStore, Tier, TierStore,
};

use crate::planner::select_agents;
use crate::types::{AssignmentConfig, AssignmentError, PlanWarning, RunSummary};

pub struct AssignmentEngine {
    store: Arc<dyn Store>,
    config: AssignmentConfig,
    liveness: LivenessThresholds,
}

impl AssignmentEngine {
    pub fn new(
        store: Arc<dyn Store>,
        config: AssignmentConfig,
        liveness: LivenessThresholds,
    ) -> Self {
        Self {
            store,
            config,
            liveness,
        }
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// One full replan. Deterministic for unchanged inputs, so rerunning
    /// produces an empty diff and leaves the version untouched.
    pub async fn run_once(&self) -> Result<RunSummary, AssignmentError> {
        let now = Utc::now();

        // Archived agents are already filtered by the store; drop offline
        // agents too so dead probes receive no work.
        let agents: Vec<_> = self
            .store
            .list_active_agents()
            .await?
            .into_iter()
            .filter(|a| a.status(now, self.liveness) != AgentStatus::Offline)
            .collect();

        let tiers: HashMap<String, Tier> = self
            .store
            .list_tiers()
            .await?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        // The monitored set and the coarser coverage sets, each resolved to
        // the tier its probe policy dictates.
        let mut workload: Vec<(Target, String)> = Vec::new();
        for target in self
            .store
            .list_targets_in_states(&[
                MonitoringState::Active,
                MonitoringState::Degraded,
                MonitoringState::Down,
            ])
            .await?
        {
            let tier = target.tier.clone();
            workload.push((target, tier));
        }
        for target in self
            .store
            .list_targets_in_states(&[MonitoringState::Unknown])
            .await?
        {
            workload.push((target, self.config.discovery_tier.clone()));
        }
        for target in self.store.targets_for_smart_recheck().await? {
            workload.push((target, self.config.recheck_tier.clone()));
        }
        for target in self
            .store
            .list_targets_in_states(&[MonitoringState::Inactive, MonitoringState::Standby])
            .await?
        {
            workload.push((target, self.config.slow_tier.clone()));
        }

        // Deterministic planning order; capacity skipping depends on it.
        workload.sort_by_key(|(t, _)| t.id);
        workload.dedup_by_key(|(t, _)| t.id);

        let mut desired: HashSet<(sentinel_store::TargetId, sentinel_store::AgentId)> =
            HashSet::new();
        let mut desired_rows: Vec<Assignment> = Vec::new();
        let mut loads: HashMap<sentinel_store::AgentId, u32> = HashMap::new();
        let mut warnings: Vec<PlanWarning> = Vec::new();

        for (target, tier_name) in &workload {
            let Some(tier) = tiers.get(tier_name) else {
                warn!(tier = %tier_name, target = %target.ip, "tier missing, target unassigned");
                warnings.push(PlanWarning::EmptyCandidatePool {
                    target_id: target.id,
                    tier: tier_name.clone(),
                });
                continue;
            };
            let (selected, warning) = select_agents(target, &tier.selection, &agents, &mut loads);
            if let Some(warning) = warning {
                warnings.push(warning);
            }
            for agent_id in selected {
                if desired.insert((target.id, agent_id)) {
                    desired_rows.push(Assignment {
                        target_id: target.id,
                        agent_id,
                        tier: tier_name.clone(),
                    });
                }
            }
        }

        // Differential against the live table.
        let current = self.store.list_assignments().await?;
        let current_keys: HashSet<_> = current.iter().map(|a| (a.target_id, a.agent_id)).collect();
        let current_tiers: HashMap<_, _> = current
            .iter()
            .map(|a| ((a.target_id, a.agent_id), a.tier.clone()))
            .collect();

        let added: Vec<Assignment> = desired_rows
            .into_iter()
            .filter(|a| {
                let key = (a.target_id, a.agent_id);
                !current_keys.contains(&key)
                    || current_tiers.get(&key).map(String::as_str) != Some(a.tier.as_str())
            })
            .collect();
        let removed: Vec<_> = current_keys
            .iter()
            .filter(|key| !desired.contains(key))
            .copied()
            .collect();

        let mut summary = RunSummary {
            targets_planned: workload.len(),
            added: added.len(),
            removed: removed.len(),
            warnings: warnings.len(),
            version: self.store.current_assignment_version().await?,
        };

        let diff = AssignmentDiff { added, removed };
        if !diff.is_empty() {
            summary.version = self.store.apply_assignment_diff(diff).await?;
            info!(
                added = summary.added,
                removed = summary.removed,
                version = summary.version,
                "assignments updated"
            );
        } else {
            debug!("assignment plan unchanged");
        }

        self.log_warnings(&warnings).await;
        Ok(summary)
    }

    /// Bootstrap path: drop everything and rebuild from scratch.
    pub async fn reinitialize(&self) -> Result<RunSummary, AssignmentError> {
        self.store.delete_all_assignments().await?;
        self.run_once().await
    }

    async fn log_warnings(&self, warnings: &[PlanWarning]) {
        for warning in warnings {
            let (target_id, event_type, details) = match warning {
                PlanWarning::EmptyCandidatePool { target_id, tier } => (
                    *target_id,
                    "assignment_pool_empty",
                    serde_json::json!({ "tier": tier }),
                ),
                PlanWarning::DiversityUnattainable {
                    target_id,
                    regions,
                    providers,
                } => (
                    *target_id,
                    "assignment_diversity_unattainable",
                    serde_json::json!({ "regions": regions, "providers": providers }),
                ),
            };
            let mut entry = ActivityEntry::new(
                ActivityCategory::Assignment,
                event_type,
                "assignment_engine",
                Utc::now(),
            );
            entry.target_id = Some(target_id);
            entry.severity = ActivitySeverity::Warning;
            entry.details = details;
            if let Err(e) = self.store.append_activity(entry).await {
                warn!(error = %e, "activity append failed");
            }
        }
    }
}

/// Periodic engine loop.
pub async fn run_assignment_worker(
    engine: Arc<AssignmentEngine>,
    token: CancellationToken,
) -> Result<(), AssignmentError> {
    let mut tick = interval(Duration::from_secs(engine.config().run_interval_secs));
    info!(
        interval_secs = engine.config().run_interval_secs,
        "assignment engine started"
    );
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = engine.run_once().await {
            warn!(error = %e, "assignment run failed");
        }
    }
    info!("assignment engine stopped");
    Ok(())
}
