//! Prometheus metrics for the alert engine.

use lazy_static::lazy_static;
use prometheus::{register_counter, Counter};

use crate::types::AlertTickSummary;

lazy_static! {
    static ref ALERTS_CREATED: Counter = register_counter!(
        "alerting_alerts_created_total",
        "Total alerts created"
    ).expect("Can't create alerts_created metric");

    static ref ALERTS_ESCALATED: Counter = register_counter!(
        "alerting_alerts_escalated_total",
        "Total alert escalations"
    ).expect("Can't create alerts_escalated metric");

    static ref ALERTS_AUTO_RESOLVED: Counter = register_counter!(
        "alerting_alerts_auto_resolved_total",
        "Total alerts auto-resolved by healthy quorum"
    ).expect("Can't create alerts_auto_resolved metric");

    static ref ALERTS_REOPENED: Counter = register_counter!(
        "alerting_alerts_reopened_total",
        "Total alerts reopened within the grace window"
    ).expect("Can't create alerts_reopened metric");
}

pub(crate) fn record_tick(summary: &AlertTickSummary) {
    ALERTS_CREATED.inc_by(summary.created as f64);
    ALERTS_ESCALATED.inc_by(summary.escalated as f64);
    ALERTS_AUTO_RESOLVED.inc_by(summary.auto_resolved as f64);
    ALERTS_REOPENED.inc_by(summary.reopened as f64);
}
