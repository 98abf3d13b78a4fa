//! Incident correlator configuration and rules.

use chrono::Duration;
use sentinel_store::{AlertSeverity, IncidentType, StoreError};
use thiserror::Error;

/// Incident correlator configuration
#[derive(Debug, Clone)]
pub struct IncidentConfig {
    /// Correlator tick period in seconds
    pub tick_secs: u64,
    /// Alerts must have evolved within this window to correlate
    pub window_secs: i64,
    /// Distinct agents at which a burst is classified global
    pub global_agent_threshold: usize,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            window_secs: 300,
            global_agent_threshold: 10,
        }
    }
}

/// Incident correlator errors
#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Minimum concurrent alerts under a correlation key before an incident is
/// opened, by key type. A lone target alert never pages by itself; a
/// subnet needs three concurrent alerts, regional keys need more.
pub fn min_cardinality(correlation_key: &str) -> usize {
    match correlation_key.split(':').next().unwrap_or("") {
        "target" => 2,
        "subnet" | "gateway" => 3,
        "agent" | "pop" => 5,
        "region" => 10,
        _ => 3,
    }
}

/// Classify the incident from its correlation key and agent spread.
pub fn classify(correlation_key: &str, distinct_agents: usize, threshold: usize) -> IncidentType {
    if distinct_agents >= threshold {
        return IncidentType::Global;
    }
    match correlation_key.split(':').next().unwrap_or("") {
        "subnet" | "pop" | "region" | "gateway" => IncidentType::Regional,
        "agent" => IncidentType::Agent,
        _ => IncidentType::Target,
    }
}

/// Confirmation wait before a pending incident goes active, sized by
/// severity so single-agent flutter cannot page.
pub fn confirmation_wait(severity: AlertSeverity) -> Duration {
    match severity {
        AlertSeverity::Critical => Duration::zero(),
        AlertSeverity::Warning => Duration::seconds(30),
        AlertSeverity::Info => Duration::seconds(120),
    }
}

/// One correlator tick's outcome
#[derive(Debug, Clone, Default)]
pub struct CorrelatorTickSummary {
    pub incidents_created: usize,
    pub alerts_linked: usize,
    pub incidents_confirmed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality_by_key_type() {
        assert_eq!(min_cardinality("target:abc"), 2);
        assert_eq!(min_cardinality("subnet:abc"), 3);
        assert_eq!(min_cardinality("pop:ord-1"), 5);
        assert_eq!(min_cardinality("region:ord"), 10);
        assert_eq!(min_cardinality("weird"), 3);
    }

    #[test]
    fn classification_rules() {
        assert_eq!(classify("subnet:x", 2, 10), IncidentType::Regional);
        assert_eq!(classify("target:x", 2, 10), IncidentType::Target);
        assert_eq!(classify("agent:x", 2, 10), IncidentType::Agent);
        assert_eq!(classify("subnet:x", 12, 10), IncidentType::Global);
    }

    #[test]
    fn confirmation_scales_with_severity() {
        assert_eq!(confirmation_wait(AlertSeverity::Critical), Duration::zero());
        assert_eq!(confirmation_wait(AlertSeverity::Warning), Duration::seconds(30));
        assert_eq!(confirmation_wait(AlertSeverity::Info), Duration::seconds(120));
    }
}
