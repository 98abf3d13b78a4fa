//! Schema DDL applied by `PgStore::migrate`. Statements are ordered and
//! individually idempotent so a partial earlier run is harmless.

pub(crate) const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS agents (
        id              UUID PRIMARY KEY,
        name            TEXT NOT NULL UNIQUE,
        region          TEXT NOT NULL DEFAULT '',
        provider        TEXT NOT NULL DEFAULT '',
        location        TEXT NOT NULL DEFAULT '',
        public_ip       TEXT,
        capabilities    JSONB NOT NULL DEFAULT '[]',
        max_targets     INTEGER NOT NULL DEFAULT 0,
        version         TEXT NOT NULL DEFAULT '',
        tags            JSONB NOT NULL DEFAULT '{}',
        api_key_hash    TEXT,
        last_heartbeat  TIMESTAMPTZ,
        archived_at     TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS agent_metrics (
        time                TIMESTAMPTZ NOT NULL,
        agent_id            UUID NOT NULL,
        cpu_pct             DOUBLE PRECISION NOT NULL DEFAULT 0,
        memory_pct          DOUBLE PRECISION NOT NULL DEFAULT 0,
        tasks               INTEGER NOT NULL DEFAULT 0,
        active_targets      INTEGER NOT NULL DEFAULT 0,
        probes_per_second   DOUBLE PRECISION NOT NULL DEFAULT 0,
        results_queued      BIGINT NOT NULL DEFAULT 0,
        results_shipped     BIGINT NOT NULL DEFAULT 0,
        assignment_version  BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (time, agent_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS subnets (
        id                          UUID PRIMARY KEY,
        cidr                        TEXT NOT NULL,
        source                      TEXT NOT NULL DEFAULT '',
        subscriber                  TEXT,
        service                     TEXT,
        location                    TEXT,
        pop                         TEXT,
        gateway_device              TEXT,
        region                      TEXT,
        vlan                        INTEGER,
        service_status              TEXT NOT NULL DEFAULT 'active',
        service_status_changed_at   TIMESTAMPTZ,
        archived_at                 TIMESTAMPTZ,
        created_at                  TIMESTAMPTZ NOT NULL,
        updated_at                  TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS targets (
        id                       UUID PRIMARY KEY,
        ip                       TEXT NOT NULL,
        tier                     TEXT NOT NULL,
        ownership                TEXT NOT NULL,
        origin                   TEXT NOT NULL,
        ip_type                  TEXT NOT NULL,
        monitoring_state         TEXT NOT NULL,
        state_changed_at         TIMESTAMPTZ NOT NULL,
        subnet_id                UUID,
        is_representative        BOOLEAN NOT NULL DEFAULT FALSE,
        needs_review             BOOLEAN NOT NULL DEFAULT FALSE,
        first_response_at        TIMESTAMPTZ,
        last_response_at         TIMESTAMPTZ,
        baseline_established_at  TIMESTAMPTZ,
        expected_outcome         JSONB,
        tags                     JSONB NOT NULL DEFAULT '{}',
        archived_at              TIMESTAMPTZ,
        created_at               TIMESTAMPTZ NOT NULL,
        updated_at               TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS targets_active_ip
        ON targets (ip) WHERE archived_at IS NULL"#,
    r#"CREATE INDEX IF NOT EXISTS targets_subnet ON targets (subnet_id)"#,
    r#"CREATE INDEX IF NOT EXISTS targets_state ON targets (monitoring_state)
        WHERE archived_at IS NULL"#,
    r#"CREATE TABLE IF NOT EXISTS tiers (
        name                      TEXT PRIMARY KEY,
        probe_interval_secs       INTEGER NOT NULL,
        timeout_ms                INTEGER NOT NULL,
        retries                   INTEGER NOT NULL,
        selection                 JSONB NOT NULL,
        default_expected_outcome  JSONB
    )"#,
    r#"CREATE TABLE IF NOT EXISTS target_assignments (
        target_id  UUID NOT NULL,
        agent_id   UUID NOT NULL,
        tier       TEXT NOT NULL,
        PRIMARY KEY (target_id, agent_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS target_assignments_agent
        ON target_assignments (agent_id)"#,
    r#"CREATE TABLE IF NOT EXISTS assignment_version (
        id       INTEGER PRIMARY KEY CHECK (id = 1),
        version  BIGINT NOT NULL
    )"#,
    r#"INSERT INTO assignment_version (id, version) VALUES (1, 0)
        ON CONFLICT (id) DO NOTHING"#,
    r#"CREATE TABLE IF NOT EXISTS assignment_changes (
        version    BIGINT NOT NULL,
        target_id  UUID NOT NULL,
        agent_id   UUID NOT NULL,
        op         TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS assignment_changes_agent
        ON assignment_changes (agent_id, version)"#,
    r#"CREATE TABLE IF NOT EXISTS probe_results (
        time             TIMESTAMPTZ NOT NULL,
        target_id        UUID NOT NULL,
        agent_id         UUID NOT NULL,
        success          BOOLEAN NOT NULL,
        error            TEXT,
        latency_ms       DOUBLE PRECISION,
        packet_loss_pct  DOUBLE PRECISION,
        payload          JSONB,
        agent_region     TEXT,
        target_region    TEXT,
        is_in_market     BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (time, target_id, agent_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS probe_results_pair
        ON probe_results (agent_id, target_id, time DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS agent_target_baseline (
        agent_id               UUID NOT NULL,
        target_id              UUID NOT NULL,
        latency_p50            DOUBLE PRECISION NOT NULL,
        latency_p95            DOUBLE PRECISION NOT NULL,
        latency_p99            DOUBLE PRECISION NOT NULL,
        latency_stddev         DOUBLE PRECISION NOT NULL,
        packet_loss_baseline   DOUBLE PRECISION NOT NULL,
        sample_count           BIGINT NOT NULL,
        first_seen             TIMESTAMPTZ NOT NULL,
        last_updated           TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (agent_id, target_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS agent_target_state (
        agent_id               UUID NOT NULL,
        target_id              UUID NOT NULL,
        status                 TEXT NOT NULL,
        status_since           TIMESTAMPTZ NOT NULL,
        current_z_score        DOUBLE PRECISION,
        current_packet_loss    DOUBLE PRECISION NOT NULL DEFAULT 0,
        current_latency_ms     DOUBLE PRECISION,
        anomaly_start          TIMESTAMPTZ,
        consecutive_anomalies  INTEGER NOT NULL DEFAULT 0,
        consecutive_successes  INTEGER NOT NULL DEFAULT 0,
        last_probe_time        TIMESTAMPTZ,
        last_evaluated         TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (agent_id, target_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS agent_target_state_status
        ON agent_target_state (status) WHERE status <> 'healthy'"#,
    r#"CREATE TABLE IF NOT EXISTS alerts (
        id                 UUID PRIMARY KEY,
        target_id          UUID NOT NULL,
        agent_id           UUID,
        alert_type         TEXT NOT NULL,
        severity           TEXT NOT NULL,
        initial_severity   TEXT NOT NULL,
        peak_severity      TEXT NOT NULL,
        status             TEXT NOT NULL,
        metrics            JSONB NOT NULL,
        initial_metrics    JSONB NOT NULL,
        peak_metrics       JSONB NOT NULL,
        detected_at        TIMESTAMPTZ NOT NULL,
        last_updated_at    TIMESTAMPTZ NOT NULL,
        resolved_at        TIMESTAMPTZ,
        acknowledged_at    TIMESTAMPTZ,
        correlation_key    TEXT NOT NULL,
        incident_id        UUID,
        enrichment         JSONB NOT NULL,
        last_escalated_at  TIMESTAMPTZ
    )"#,
    r#"CREATE INDEX IF NOT EXISTS alerts_target ON alerts (target_id, alert_type)"#,
    r#"CREATE INDEX IF NOT EXISTS alerts_open ON alerts (status)
        WHERE status IN ('active', 'acknowledged')"#,
    r#"CREATE TABLE IF NOT EXISTS alert_events (
        id            UUID PRIMARY KEY,
        alert_id      UUID NOT NULL,
        event_type    TEXT NOT NULL,
        old_severity  TEXT,
        new_severity  TEXT,
        old_status    TEXT,
        new_status    TEXT,
        metrics       JSONB,
        description   TEXT NOT NULL DEFAULT '',
        triggered_by  TEXT NOT NULL DEFAULT '',
        created_at    TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS alert_events_alert
        ON alert_events (alert_id, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS alert_config (
        id      INTEGER PRIMARY KEY CHECK (id = 1),
        config  JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS incidents (
        id                   UUID PRIMARY KEY,
        correlation_key      TEXT NOT NULL,
        incident_type        TEXT NOT NULL,
        severity             TEXT NOT NULL,
        status               TEXT NOT NULL,
        affected_target_ids  JSONB NOT NULL DEFAULT '[]',
        affected_agent_ids   JSONB NOT NULL DEFAULT '[]',
        alert_count          INTEGER NOT NULL DEFAULT 0,
        peak_alert_count     INTEGER NOT NULL DEFAULT 0,
        peak_severity        TEXT NOT NULL,
        detected_at          TIMESTAMPTZ NOT NULL,
        confirmed_at         TIMESTAMPTZ,
        acknowledged_at      TIMESTAMPTZ,
        resolved_at          TIMESTAMPTZ,
        created_at           TIMESTAMPTZ NOT NULL,
        updated_at           TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS incidents_correlation
        ON incidents (correlation_key) WHERE status <> 'resolved'"#,
    r#"CREATE TABLE IF NOT EXISTS target_state_history (
        id            UUID PRIMARY KEY,
        target_id     UUID NOT NULL,
        old_state     TEXT NOT NULL,
        new_state     TEXT NOT NULL,
        reason        TEXT NOT NULL DEFAULT '',
        triggered_by  TEXT NOT NULL DEFAULT '',
        created_at    TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS target_state_history_target
        ON target_state_history (target_id, created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS activity_log (
        id            UUID PRIMARY KEY,
        target_id     UUID,
        subnet_id     UUID,
        agent_id      UUID,
        ip            TEXT,
        category      TEXT NOT NULL,
        event_type    TEXT NOT NULL,
        details       JSONB NOT NULL DEFAULT 'null',
        triggered_by  TEXT NOT NULL DEFAULT '',
        severity      TEXT NOT NULL DEFAULT 'info',
        created_at    TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS activity_log_time ON activity_log (created_at DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS commands (
        id            UUID PRIMARY KEY,
        command       TEXT NOT NULL,
        payload       JSONB NOT NULL DEFAULT 'null',
        agent_ids     JSONB NOT NULL DEFAULT '[]',
        quorum        INTEGER NOT NULL DEFAULT 1,
        created_at    TIMESTAMPTZ NOT NULL,
        expires_at    TIMESTAMPTZ NOT NULL,
        completed_at  TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS command_results (
        command_id    UUID NOT NULL,
        agent_id      UUID NOT NULL,
        success       BOOLEAN NOT NULL,
        output        JSONB NOT NULL DEFAULT 'null',
        submitted_at  TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (command_id, agent_id)
    )"#,
    // Aggregate views over probe results. The query layer picks the
    // coarsest view that satisfies the requested window.
    r#"CREATE OR REPLACE VIEW probe_5min AS
        SELECT to_timestamp(floor(extract(epoch FROM time) / 300) * 300) AS bucket,
               target_id, agent_id, agent_region, target_region,
               count(*) AS probe_count,
               count(*) FILTER (WHERE success) AS success_count,
               avg(latency_ms) AS avg_latency_ms,
               min(latency_ms) AS min_latency_ms,
               max(latency_ms) AS max_latency_ms,
               percentile_cont(0.5) WITHIN GROUP (ORDER BY latency_ms) AS p50_latency_ms,
               percentile_cont(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95_latency_ms,
               percentile_cont(0.99) WITHIN GROUP (ORDER BY latency_ms) AS p99_latency_ms,
               stddev_samp(latency_ms) AS jitter_ms,
               avg(packet_loss_pct) AS avg_packet_loss_pct
        FROM probe_results
        GROUP BY 1, 2, 3, 4, 5"#,
    r#"CREATE OR REPLACE VIEW probe_hourly AS
        SELECT date_trunc('hour', time) AS bucket,
               target_id, agent_id, agent_region, target_region,
               count(*) AS probe_count,
               count(*) FILTER (WHERE success) AS success_count,
               avg(latency_ms) AS avg_latency_ms,
               min(latency_ms) AS min_latency_ms,
               max(latency_ms) AS max_latency_ms,
               percentile_cont(0.5) WITHIN GROUP (ORDER BY latency_ms) AS p50_latency_ms,
               percentile_cont(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95_latency_ms,
               percentile_cont(0.99) WITHIN GROUP (ORDER BY latency_ms) AS p99_latency_ms,
               stddev_samp(latency_ms) AS jitter_ms,
               avg(packet_loss_pct) AS avg_packet_loss_pct
        FROM probe_results
        GROUP BY 1, 2, 3, 4, 5"#,
    r#"CREATE OR REPLACE VIEW probe_daily AS
        SELECT date_trunc('day', time) AS bucket,
               target_id, agent_id, agent_region, target_region,
               count(*) AS probe_count,
               count(*) FILTER (WHERE success) AS success_count,
               avg(latency_ms) AS avg_latency_ms,
               min(latency_ms) AS min_latency_ms,
               max(latency_ms) AS max_latency_ms,
               percentile_cont(0.5) WITHIN GROUP (ORDER BY latency_ms) AS p50_latency_ms,
               percentile_cont(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95_latency_ms,
               percentile_cont(0.99) WITHIN GROUP (ORDER BY latency_ms) AS p99_latency_ms,
               stddev_samp(latency_ms) AS jitter_ms,
               avg(packet_loss_pct) AS avg_packet_loss_pct
        FROM probe_results
        GROUP BY 1, 2, 3, 4, 5"#,
    r#"CREATE OR REPLACE VIEW probe_monthly AS
        SELECT date_trunc('month', time) AS bucket,
               target_id, agent_id, agent_region, target_region,
               count(*) AS probe_count,
               count(*) FILTER (WHERE success) AS success_count,
               avg(latency_ms) AS avg_latency_ms,
               min(latency_ms) AS min_latency_ms,
               max(latency_ms) AS max_latency_ms,
               percentile_cont(0.5) WITHIN GROUP (ORDER BY latency_ms) AS p50_latency_ms,
               percentile_cont(0.95) WITHIN GROUP (ORDER BY latency_ms) AS p95_latency_ms,
               percentile_cont(0.99) WITHIN GROUP (ORDER BY latency_ms) AS p99_latency_ms,
               stddev_samp(latency_ms) AS jitter_ms,
               avg(packet_loss_pct) AS avg_packet_loss_pct
        FROM probe_results
        GROUP BY 1, 2, 3, 4, 5"#,
];
