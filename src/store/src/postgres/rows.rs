//! Row-to-entity mapping for the Postgres backend.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::{enum_parse, from_json};
use crate::types::*;

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Backend(format!("column '{column}': {e}")))
}

pub(crate) fn parse_ipv4(s: &str) -> StoreResult<Ipv4Addr> {
    s.parse()
        .map_err(|_| StoreError::Backend(format!("bad ipv4 '{s}'")))
}

pub(crate) fn parse_cidr(s: &str) -> StoreResult<Ipv4Net> {
    s.parse()
        .map_err(|_| StoreError::Backend(format!("bad cidr '{s}'")))
}

fn opt_enum<T: serde::de::DeserializeOwned>(value: Option<String>) -> StoreResult<Option<T>> {
    value.map(|s| enum_parse(&s)).transpose()
}

pub(crate) fn agent(row: &PgRow) -> StoreResult<Agent> {
    Ok(Agent {
        id: get(row, "id")?,
        name: get(row, "name")?,
        region: get(row, "region")?,
        provider: get(row, "provider")?,
        location: get(row, "location")?,
        public_ip: get::<Option<String>>(row, "public_ip")?
            .map(|s| parse_ipv4(&s))
            .transpose()?,
        capabilities: from_json(get(row, "capabilities")?)?,
        max_targets: get::<i32>(row, "max_targets")? as u32,
        version: get(row, "version")?,
        tags: from_json(get(row, "tags")?)?,
        api_key_hash: get(row, "api_key_hash")?,
        last_heartbeat: get(row, "last_heartbeat")?,
        archived_at: get(row, "archived_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn agent_metrics(row: &PgRow) -> StoreResult<AgentMetricsRow> {
    Ok(AgentMetricsRow {
        time: get(row, "time")?,
        agent_id: get(row, "agent_id")?,
        cpu_pct: get(row, "cpu_pct")?,
        memory_pct: get(row, "memory_pct")?,
        tasks: get::<i32>(row, "tasks")? as u32,
        active_targets: get::<i32>(row, "active_targets")? as u32,
        probes_per_second: get(row, "probes_per_second")?,
        results_queued: get::<i64>(row, "results_queued")? as u64,
        results_shipped: get::<i64>(row, "results_shipped")? as u64,
        assignment_version: get::<i64>(row, "assignment_version")? as u64,
    })
}

pub(crate) fn subnet(row: &PgRow) -> StoreResult<Subnet> {
    Ok(Subnet {
        id: get(row, "id")?,
        cidr: parse_cidr(&get::<String>(row, "cidr")?)?,
        source: get(row, "source")?,
        subscriber: get(row, "subscriber")?,
        service: get(row, "service")?,
        location: get(row, "location")?,
        pop: get(row, "pop")?,
        gateway_device: get(row, "gateway_device")?,
        region: get(row, "region")?,
        vlan: get(row, "vlan")?,
        service_status: enum_parse(&get::<String>(row, "service_status")?)?,
        service_status_changed_at: get(row, "service_status_changed_at")?,
        archived_at: get(row, "archived_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn target(row: &PgRow) -> StoreResult<Target> {
    let expected: Option<serde_json::Value> = get(row, "expected_outcome")?;
    Ok(Target {
        id: get(row, "id")?,
        ip: parse_ipv4(&get::<String>(row, "ip")?)?,
        tier: get(row, "tier")?,
        ownership: enum_parse(&get::<String>(row, "ownership")?)?,
        origin: enum_parse(&get::<String>(row, "origin")?)?,
        ip_type: enum_parse(&get::<String>(row, "ip_type")?)?,
        monitoring_state: enum_parse(&get::<String>(row, "monitoring_state")?)?,
        state_changed_at: get(row, "state_changed_at")?,
        subnet_id: get(row, "subnet_id")?,
        is_representative: get(row, "is_representative")?,
        needs_review: get(row, "needs_review")?,
        first_response_at: get(row, "first_response_at")?,
        last_response_at: get(row, "last_response_at")?,
        baseline_established_at: get(row, "baseline_established_at")?,
        expected_outcome: expected.map(from_json).transpose()?,
        tags: from_json(get(row, "tags")?)?,
        archived_at: get(row, "archived_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn tier(row: &PgRow) -> StoreResult<Tier> {
    let default_expected: Option<serde_json::Value> = get(row, "default_expected_outcome")?;
    Ok(Tier {
        name: get(row, "name")?,
        probe_interval_secs: get::<i32>(row, "probe_interval_secs")? as u32,
        timeout_ms: get::<i32>(row, "timeout_ms")? as u32,
        retries: get::<i32>(row, "retries")? as u32,
        selection: from_json(get(row, "selection")?)?,
        default_expected_outcome: default_expected.map(from_json).transpose()?,
    })
}

pub(crate) fn assignment(row: &PgRow) -> StoreResult<Assignment> {
    Ok(Assignment {
        target_id: get(row, "target_id")?,
        agent_id: get(row, "agent_id")?,
        tier: get(row, "tier")?,
    })
}

pub(crate) fn assignment_change(row: &PgRow) -> StoreResult<AssignmentChange> {
    Ok(AssignmentChange {
        version: get::<i64>(row, "version")? as u64,
        target_id: get(row, "target_id")?,
        agent_id: get(row, "agent_id")?,
        op: enum_parse(&get::<String>(row, "op")?)?,
    })
}

pub(crate) fn pair_baseline(row: &PgRow) -> StoreResult<PairBaseline> {
    Ok(PairBaseline {
        agent_id: get(row, "agent_id")?,
        target_id: get(row, "target_id")?,
        latency_p50: get(row, "latency_p50")?,
        latency_p95: get(row, "latency_p95")?,
        latency_p99: get(row, "latency_p99")?,
        latency_stddev: get(row, "latency_stddev")?,
        packet_loss_baseline: get(row, "packet_loss_baseline")?,
        sample_count: get::<i64>(row, "sample_count")? as u64,
        first_seen: get(row, "first_seen")?,
        last_updated: get(row, "last_updated")?,
    })
}

pub(crate) fn pair_state(row: &PgRow) -> StoreResult<PairState> {
    Ok(PairState {
        agent_id: get(row, "agent_id")?,
        target_id: get(row, "target_id")?,
        status: enum_parse(&get::<String>(row, "status")?)?,
        status_since: get(row, "status_since")?,
        current_z_score: get(row, "current_z_score")?,
        current_packet_loss: get(row, "current_packet_loss")?,
        current_latency_ms: get(row, "current_latency_ms")?,
        anomaly_start: get(row, "anomaly_start")?,
        consecutive_anomalies: get::<i32>(row, "consecutive_anomalies")? as u32,
        consecutive_successes: get::<i32>(row, "consecutive_successes")? as u32,
        last_probe_time: get(row, "last_probe_time")?,
        last_evaluated: get(row, "last_evaluated")?,
    })
}

pub(crate) fn alert(row: &PgRow) -> StoreResult<Alert> {
    Ok(Alert {
        id: get(row, "id")?,
        target_id: get(row, "target_id")?,
        agent_id: get(row, "agent_id")?,
        alert_type: enum_parse(&get::<String>(row, "alert_type")?)?,
        severity: enum_parse(&get::<String>(row, "severity")?)?,
        initial_severity: enum_parse(&get::<String>(row, "initial_severity")?)?,
        peak_severity: enum_parse(&get::<String>(row, "peak_severity")?)?,
        status: enum_parse(&get::<String>(row, "status")?)?,
        metrics: from_json(get(row, "metrics")?)?,
        initial_metrics: from_json(get(row, "initial_metrics")?)?,
        peak_metrics: from_json(get(row, "peak_metrics")?)?,
        detected_at: get(row, "detected_at")?,
        last_updated_at: get(row, "last_updated_at")?,
        resolved_at: get(row, "resolved_at")?,
        acknowledged_at: get(row, "acknowledged_at")?,
        correlation_key: get(row, "correlation_key")?,
        incident_id: get(row, "incident_id")?,
        enrichment: from_json(get(row, "enrichment")?)?,
        last_escalated_at: get(row, "last_escalated_at")?,
    })
}

pub(crate) fn alert_event(row: &PgRow) -> StoreResult<AlertEvent> {
    let metrics: Option<serde_json::Value> = get(row, "metrics")?;
    Ok(AlertEvent {
        id: get(row, "id")?,
        alert_id: get(row, "alert_id")?,
        event_type: enum_parse(&get::<String>(row, "event_type")?)?,
        old_severity: opt_enum(get(row, "old_severity")?)?,
        new_severity: opt_enum(get(row, "new_severity")?)?,
        old_status: opt_enum(get(row, "old_status")?)?,
        new_status: opt_enum(get(row, "new_status")?)?,
        metrics: metrics.map(from_json).transpose()?,
        description: get(row, "description")?,
        triggered_by: get(row, "triggered_by")?,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn incident(row: &PgRow) -> StoreResult<Incident> {
    Ok(Incident {
        id: get(row, "id")?,
        correlation_key: get(row, "correlation_key")?,
        incident_type: enum_parse(&get::<String>(row, "incident_type")?)?,
        severity: enum_parse(&get::<String>(row, "severity")?)?,
        status: enum_parse(&get::<String>(row, "status")?)?,
        affected_target_ids: from_json(get(row, "affected_target_ids")?)?,
        affected_agent_ids: from_json(get(row, "affected_agent_ids")?)?,
        alert_count: get::<i32>(row, "alert_count")? as u32,
        peak_alert_count: get::<i32>(row, "peak_alert_count")? as u32,
        peak_severity: enum_parse(&get::<String>(row, "peak_severity")?)?,
        detected_at: get(row, "detected_at")?,
        confirmed_at: get(row, "confirmed_at")?,
        acknowledged_at: get(row, "acknowledged_at")?,
        resolved_at: get(row, "resolved_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) fn activity_entry(row: &PgRow) -> StoreResult<ActivityEntry> {
    Ok(ActivityEntry {
        id: get(row, "id")?,
        target_id: get(row, "target_id")?,
        subnet_id: get(row, "subnet_id")?,
        agent_id: get(row, "agent_id")?,
        ip: get::<Option<String>>(row, "ip")?
            .map(|s| parse_ipv4(&s))
            .transpose()?,
        category: enum_parse(&get::<String>(row, "category")?)?,
        event_type: get(row, "event_type")?,
        details: get(row, "details")?,
        triggered_by: get(row, "triggered_by")?,
        severity: enum_parse(&get::<String>(row, "severity")?)?,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn target_state_history(row: &PgRow) -> StoreResult<TargetStateHistory> {
    Ok(TargetStateHistory {
        id: get(row, "id")?,
        target_id: get(row, "target_id")?,
        old_state: enum_parse(&get::<String>(row, "old_state")?)?,
        new_state: enum_parse(&get::<String>(row, "new_state")?)?,
        reason: get(row, "reason")?,
        triggered_by: get(row, "triggered_by")?,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn command(row: &PgRow) -> StoreResult<Command> {
    Ok(Command {
        id: get(row, "id")?,
        command: get(row, "command")?,
        payload: get(row, "payload")?,
        agent_ids: from_json::<Vec<Uuid>>(get(row, "agent_ids")?)?,
        quorum: get::<i32>(row, "quorum")? as u32,
        created_at: get(row, "created_at")?,
        expires_at: get(row, "expires_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

pub(crate) fn probe_result(row: &PgRow) -> StoreResult<ProbeResult> {
    Ok(ProbeResult {
        time: get::<DateTime<Utc>>(row, "time")?,
        target_id: get(row, "target_id")?,
        agent_id: get(row, "agent_id")?,
        success: get(row, "success")?,
        error: get(row, "error")?,
        latency_ms: get(row, "latency_ms")?,
        packet_loss_pct: get(row, "packet_loss_pct")?,
        payload: get(row, "payload")?,
        agent_region: get(row, "agent_region")?,
        target_region: get(row, "target_region")?,
        is_in_market: get(row, "is_in_market")?,
    })
}
