//! Lifecycle configuration, transition rules and errors.

use sentinel_store::{MonitoringState, StoreError};
use thiserror::Error;

/// Target lifecycle configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Degraded target with no responses for this long goes down
    pub down_after_secs: i64,
    /// Unknown target never observed for this long becomes unresponsive
    pub unresponsive_after_secs: i64,
    /// Down target stuck for this long becomes excluded (needs review)
    pub exclude_after_secs: i64,
    /// A response within this window counts as "responding again"
    pub recovery_window_secs: i64,
    /// Transition scan interval
    pub scan_interval_secs: u64,
    /// Representative election interval
    pub election_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            down_after_secs: 600,            // 10 minutes
            unresponsive_after_secs: 7_200,  // 2 hours of silence since creation
            exclude_after_secs: 604_800,     // 7 days
            recovery_window_secs: 300,
            scan_interval_secs: 60,
            election_interval_secs: 300,
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(MonitoringState, MonitoringState),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Whether the state machine permits `from -> to`. Archival is handled
/// separately (any state may be archived); identical states are a no-op at
/// the store layer.
pub fn transition_allowed(from: MonitoringState, to: MonitoringState) -> bool {
    use MonitoringState::*;
    match (from, to) {
        // First observation, or operator decisions, can come from anywhere.
        (_, Active) | (_, Inactive) => true,
        (Unknown, Unresponsive) => true,
        (Active, Degraded) | (Active, Standby) => true,
        (Standby, Degraded) => true,
        (Degraded, Down) => true,
        (Down, Excluded) => true,
        // Re-checks can surface silence directly.
        (Excluded, Unresponsive) | (Unresponsive, Excluded) => true,
        _ => false,
    }
}
