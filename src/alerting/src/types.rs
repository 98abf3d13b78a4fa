//! Alert engine configuration, anomaly signals and errors.

use sentinel_store::{
    AgentId, AlertMetrics, AlertSeverity, AlertType, StoreError, TargetId,
};
use thiserror::Error;

/// Alert engine configuration
#[derive(Debug, Clone)]
pub struct AlertingConfig {
    /// Engine tick period in seconds
    pub tick_secs: u64,
    /// Distinct anomalous agents required for a consensus alert
    pub consensus_min_agents: usize,
    /// Packet loss (pct) at or above which an anomaly rates critical
    pub critical_loss_pct: f64,
    /// z-score at or above which an anomaly rates critical
    pub critical_zscore: f64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            consensus_min_agents: 2,
            critical_loss_pct: 20.0,
            critical_zscore: 6.0,
        }
    }
}

/// Alert engine errors
#[derive(Debug, Error)]
pub enum AlertingError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// A single observation deviating from baseline, derived each tick from the
/// evaluator's non-healthy pair states.
#[derive(Debug, Clone)]
pub struct AnomalySignal {
    pub target_id: TargetId,
    /// `None` marks a consensus signal across several agents
    pub agent_id: Option<AgentId>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub metrics: AlertMetrics,
}

/// One engine tick's outcome
#[derive(Debug, Clone, Default)]
pub struct AlertTickSummary {
    pub signals: usize,
    pub created: usize,
    pub escalated: usize,
    pub de_escalated: usize,
    pub reopened: usize,
    pub auto_resolved: usize,
}

/// Healthy-agent quorum required to auto-resolve a target's alerts.
/// `pilot_infra` and `infrastructure` demand full agreement; gateways need
/// three; everything else uses the configured default.
pub fn auto_resolve_quorum(tier: &str, assigned_agents: usize, default_min: u32) -> usize {
    match tier {
        "pilot_infra" | "infrastructure" => assigned_agents,
        "vlan_gateway" => assigned_agents.min(3),
        _ => (default_min as usize).min(assigned_agents),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_rules() {
        assert_eq!(auto_resolve_quorum("pilot_infra", 5, 2), 5);
        assert_eq!(auto_resolve_quorum("infrastructure", 4, 2), 4);
        assert_eq!(auto_resolve_quorum("vlan_gateway", 5, 2), 3);
        assert_eq!(auto_resolve_quorum("vlan_gateway", 2, 2), 2);
        assert_eq!(auto_resolve_quorum("default", 5, 2), 2);
        assert_eq!(auto_resolve_quorum("default", 1, 2), 1);
    }
}
