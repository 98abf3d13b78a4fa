//! # Target Lifecycle Manager
//!
//! Owns the per-target monitoring state machine and the subnet↔target
//! relationship: threshold-driven transitions (degraded→down→excluded,
//! unknown→unresponsive), recovery on resumed responses, the smart
//! re-check eligibility set, the service-cancellation cascade and
//! representative election. Every transition goes through the store's
//! transactional path, which writes the history row and the activity entry
//! alongside the state change.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use sentinel_store::{
    MonitoringState, Store, Subnet, SubnetId, SubnetServiceStatus, SubnetStore, Target, TargetId,
    TargetStore,
};

use crate::types::{transition_allowed, LifecycleConfig, LifecycleError};

/// States swept to `inactive` when a subnet's service is cancelled:
/// everything except already-inactive, excluded and archived targets.
const CANCELLATION_SWEEP: &[MonitoringState] = &[
    MonitoringState::Unknown,
    MonitoringState::Active,
    MonitoringState::Degraded,
    MonitoringState::Down,
    MonitoringState::Unresponsive,
    MonitoringState::Standby,
];

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Apply a guarded transition.
    pub async fn transition(
        &self,
        target: &Target,
        to: MonitoringState,
        reason: &str,
        triggered_by: &str,
    ) -> Result<Target, LifecycleError> {
        if target.monitoring_state == to {
            return Ok(target.clone());
        }
        if !transition_allowed(target.monitoring_state, to) {
            return Err(LifecycleError::InvalidTransition(
                target.monitoring_state,
                to,
            ));
        }
        let needs_review = match to {
            MonitoringState::Excluded => Some(true),
            MonitoringState::Active => Some(false),
            _ => None,
        };
        Ok(self
            .store
            .transition_target_state(target.id, to, reason, triggered_by, needs_review)
            .await?)
    }

    /// One full transition scan. Returns the number of targets moved.
    pub async fn run_transition_scan(&self) -> Result<usize, LifecycleError> {
        let now = Utc::now();
        let mut moved = 0;

        // Targets that resumed responding come back to active first, so the
        // threshold passes below never fight a live target.
        let recovery_floor = now - Duration::seconds(self.config.recovery_window_secs);
        let candidates = self
            .store
            .list_targets_in_states(&[
                MonitoringState::Unknown,
                MonitoringState::Degraded,
                MonitoringState::Down,
                MonitoringState::Unresponsive,
                MonitoringState::Excluded,
            ])
            .await?;
        for target in candidates {
            let responded = target
                .last_response_at
                .map(|at| at >= recovery_floor)
                .unwrap_or(false);
            if responded {
                self.transition(&target, MonitoringState::Active, "responses resumed", "lifecycle_worker")
                    .await?;
                moved += 1;
            }
        }

        for target in self
            .store
            .targets_eligible_for_down(now, Duration::seconds(self.config.down_after_secs))
            .await?
        {
            self.transition(
                &target,
                MonitoringState::Down,
                "no responses past down threshold",
                "lifecycle_worker",
            )
            .await?;
            moved += 1;
        }

        for target in self
            .store
            .targets_eligible_for_unresponsive(
                now,
                Duration::seconds(self.config.unresponsive_after_secs),
            )
            .await?
        {
            self.transition(
                &target,
                MonitoringState::Unresponsive,
                "never observed",
                "lifecycle_worker",
            )
            .await?;
            moved += 1;
        }

        for target in self
            .store
            .targets_eligible_for_excluded(now, Duration::seconds(self.config.exclude_after_secs))
            .await?
        {
            self.transition(
                &target,
                MonitoringState::Excluded,
                "down past exclusion threshold",
                "lifecycle_worker",
            )
            .await?;
            moved += 1;
        }

        Ok(moved)
    }

    /// Unresponsive/excluded targets worth probing again: only those whose
    /// subnet has zero active customer coverage. Keeps subnet-level
    /// guarantees without amplifying probes at intentionally-silent IPs.
    pub async fn smart_recheck_set(&self) -> Result<Vec<Target>, LifecycleError> {
        Ok(self.store.targets_for_smart_recheck().await?)
    }

    /// Operator action: confirm a target is expected to be silent.
    pub async fn mark_inactive(
        &self,
        target_id: TargetId,
        triggered_by: &str,
    ) -> Result<Target, LifecycleError> {
        let target = self
            .store
            .get_target(target_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("target"))?;
        self.transition(&target, MonitoringState::Inactive, "operator confirmed silent", triggered_by)
            .await
    }

    /// Operator action: clear the review flag on an excluded target.
    pub async fn acknowledge_review(&self, target_id: TargetId) -> Result<(), LifecycleError> {
        let mut target = self
            .store
            .get_target(target_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("target"))?;
        if !target.needs_review {
            return Ok(());
        }
        target.needs_review = false;
        target.updated_at = Utc::now();
        self.store.update_target(target).await?;
        Ok(())
    }

    /// React to a subnet service-status change. Cancellation sweeps every
    /// live target to `inactive` in one transaction.
    pub async fn on_subnet_service_change(
        &self,
        subnet: &Subnet,
        new_status: SubnetServiceStatus,
    ) -> Result<Vec<TargetId>, LifecycleError> {
        self.store
            .set_subnet_service_status(subnet.id, new_status, Utc::now())
            .await?;
        if new_status != SubnetServiceStatus::Cancelled {
            return Ok(Vec::new());
        }
        let moved = self
            .store
            .transition_targets_in_subnet(
                subnet.id,
                CANCELLATION_SWEEP,
                MonitoringState::Inactive,
                "subnet service cancelled",
                "subnet_sync",
            )
            .await?;
        info!(subnet = %subnet.cidr, targets = moved.len(), "service cancellation cascade");
        Ok(moved)
    }

    /// Archive a subnet: auto-owned targets are archived with it (keeping
    /// `subnet_id` for history), manual targets are orphaned.
    pub async fn on_subnet_archived(&self, subnet_id: SubnetId) -> Result<(), LifecycleError> {
        let now = Utc::now();
        self.store.set_subnet_archived(subnet_id, Some(now)).await?;
        for target in self.store.list_targets_in_subnet(subnet_id).await? {
            if target.archived_at.is_some() {
                continue;
            }
            match target.ownership {
                sentinel_store::Ownership::Auto => {
                    self.store.set_target_archived(target.id, Some(now)).await?;
                }
                sentinel_store::Ownership::Manual => {
                    let mut orphaned = target;
                    orphaned.subnet_id = None;
                    orphaned.updated_at = now;
                    self.store.update_target(orphaned).await?;
                }
            }
        }
        Ok(())
    }

    /// Representative election across active subnets. Each active subnet
    /// keeps exactly one customer target with an established baseline as
    /// its health proxy; when the incumbent dies, the oldest-baseline
    /// standby is promoted.
    pub async fn run_representative_election(&self) -> Result<usize, LifecycleError> {
        let mut elected = 0;
        for subnet in self.store.list_active_subnets().await? {
            match self.elect_for_subnet(&subnet).await {
                Ok(true) => elected += 1,
                Ok(false) => {}
                Err(e) => warn!(subnet = %subnet.cidr, error = %e, "election failed"),
            }
        }
        Ok(elected)
    }

    async fn elect_for_subnet(&self, subnet: &Subnet) -> Result<bool, LifecycleError> {
        let targets = self.store.list_targets_in_subnet(subnet.id).await?;
        let incumbent = targets.iter().find(|t| {
            t.is_representative
                && t.archived_at.is_none()
                && t.ip_type == sentinel_store::IpType::Customer
        });

        let incumbent_alive = incumbent
            .map(|t| {
                matches!(
                    t.monitoring_state,
                    MonitoringState::Active | MonitoringState::Degraded
                )
            })
            .unwrap_or(false);
        if incumbent_alive {
            return Ok(false);
        }

        // Promote the standby whose baseline has stood the longest; fall
        // back to any live customer target with an established baseline.
        let candidate = match self
            .store
            .list_representative_candidates(subnet.id)
            .await?
            .into_iter()
            .next()
        {
            Some(standby) => Some(standby),
            None => targets
                .iter()
                .filter(|t| {
                    t.archived_at.is_none()
                        && t.ip_type == sentinel_store::IpType::Customer
                        && t.baseline_established_at.is_some()
                        && matches!(
                            t.monitoring_state,
                            MonitoringState::Active | MonitoringState::Degraded
                        )
                        && !t.is_representative
                })
                .min_by_key(|t| t.baseline_established_at)
                .cloned(),
        };
        let Some(candidate) = candidate else {
            return Ok(false);
        };

        self.store.set_representative(subnet.id, candidate.id).await?;
        if candidate.monitoring_state == MonitoringState::Standby {
            self.transition(
                &candidate,
                MonitoringState::Active,
                "promoted to subnet representative",
                "lifecycle_worker",
            )
            .await?;
        }
        info!(subnet = %subnet.cidr, target = %candidate.ip, "representative elected");
        Ok(true)
    }
}
