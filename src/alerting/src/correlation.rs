//! Correlation keys and hot-spot aggregation over active alerts.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use sentinel_store::{Alert, AlertSeverity, Target};

/// Correlation key for a target's alerts: subnet-scoped when the target
/// belongs to one, otherwise target-scoped. The key is the dimension under
/// which the incident correlator groups concurrent alerts.
pub fn correlation_key(target: &Target) -> String {
    match target.subnet_id {
        Some(subnet_id) => format!("subnet:{subnet_id}"),
        None => format!("target:{}", target.id),
    }
}

/// A dimension value with elevated alert pressure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotSpot {
    pub dimension: String,
    pub value: String,
    pub alert_count: usize,
    pub target_count: usize,
    pub agent_count: usize,
    pub max_severity: AlertSeverity,
}

/// Aggregate active alerts by their enrichment dimensions (PoP, gateway
/// device, subscriber, location, region). Powers the hot-spot summary.
pub fn hot_spots(alerts: &[Alert]) -> Vec<HotSpot> {
    let mut buckets: HashMap<(&'static str, String), Vec<&Alert>> = HashMap::new();
    for alert in alerts {
        let e = &alert.enrichment;
        for (dimension, value) in [
            ("pop", e.pop.clone()),
            ("gateway_device", e.gateway_device.clone()),
            ("subscriber", e.subscriber.clone()),
            ("location", e.location.clone()),
            ("region", e.region.clone()),
        ] {
            if let Some(value) = value {
                buckets.entry((dimension, value)).or_default().push(alert);
            }
        }
    }

    let mut spots: Vec<HotSpot> = buckets
        .into_iter()
        .map(|((dimension, value), members)| {
            let targets: HashSet<_> = members.iter().map(|a| a.target_id).collect();
            let agents: HashSet<_> = members.iter().filter_map(|a| a.agent_id).collect();
            let max_severity = members
                .iter()
                .map(|a| a.severity)
                .max()
                .unwrap_or(AlertSeverity::Info);
            HotSpot {
                dimension: dimension.to_string(),
                value,
                alert_count: members.len(),
                target_count: targets.len(),
                agent_count: agents.len(),
                max_severity,
            }
        })
        .collect();
    spots.sort_by(|a, b| {
        b.max_severity
            .cmp(&a.max_severity)
            .then(b.alert_count.cmp(&a.alert_count))
            .then(a.value.cmp(&b.value))
    });
    spots
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentinel_store::{
        AlertEnrichment, AlertMetrics, AlertStatus, AlertType,
    };
    use uuid::Uuid;

    fn alert(pop: Option<&str>, severity: AlertSeverity) -> Alert {
        let now = Utc::now();
        Alert {
            id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            agent_id: Some(Uuid::new_v4()),
            alert_type: AlertType::LatencyAnomaly,
            severity,
            initial_severity: severity,
            peak_severity: severity,
            status: AlertStatus::Active,
            metrics: AlertMetrics::default(),
            initial_metrics: AlertMetrics::default(),
            peak_metrics: AlertMetrics::default(),
            detected_at: now,
            last_updated_at: now,
            resolved_at: None,
            acknowledged_at: None,
            correlation_key: "target:x".to_string(),
            incident_id: None,
            enrichment: AlertEnrichment {
                pop: pop.map(str::to_string),
                ..AlertEnrichment::default()
            },
            last_escalated_at: None,
        }
    }

    #[test]
    fn hot_spots_rank_by_severity_then_count() {
        let alerts = vec![
            alert(Some("pop-a"), AlertSeverity::Warning),
            alert(Some("pop-a"), AlertSeverity::Warning),
            alert(Some("pop-b"), AlertSeverity::Critical),
        ];
        let spots = hot_spots(&alerts);
        assert_eq!(spots[0].value, "pop-b");
        assert_eq!(spots[0].max_severity, AlertSeverity::Critical);
        assert_eq!(spots[1].value, "pop-a");
        assert_eq!(spots[1].alert_count, 2);
        assert_eq!(spots[1].target_count, 2);
    }

    #[test]
    fn alerts_without_enrichment_produce_no_spots() {
        let alerts = vec![alert(None, AlertSeverity::Critical)];
        assert!(hot_spots(&alerts).is_empty());
    }
}
