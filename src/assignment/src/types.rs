//! Assignment engine configuration, plan outcomes and errors.

use sentinel_store::{StoreError, TargetId};
use thiserror::Error;

/// Assignment engine configuration
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Periodic replan interval in seconds
    pub run_interval_secs: u64,
    /// Tier used for targets that were never observed
    pub discovery_tier: String,
    /// Tier used for smart re-check candidates
    pub recheck_tier: String,
    /// Tier used for inactive/standby targets (slow coverage)
    pub slow_tier: String,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: 60,
            discovery_tier: "discovery".to_string(),
            recheck_tier: "smart_recheck".to_string(),
            slow_tier: "slow".to_string(),
        }
    }
}

/// Assignment engine errors
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Non-fatal planning conditions surfaced through the activity log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanWarning {
    /// No agent passed the tier's filters; the target stays unassigned
    EmptyCandidatePool { target_id: TargetId, tier: String },
    /// Selection was widened but the diversity floor is still unattainable
    DiversityUnattainable {
        target_id: TargetId,
        regions: usize,
        providers: usize,
    },
}

/// One engine run summary
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub targets_planned: usize,
    pub added: usize,
    pub removed: usize,
    pub warnings: usize,
    /// New assignment version, unchanged when the diff was empty
    pub version: u64,
}
