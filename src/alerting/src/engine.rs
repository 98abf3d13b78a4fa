//! # Alert Engine
//!
//! Turns the evaluator's non-healthy pair states into evolving alerts:
//! create with an enrichment snapshot, escalate/de-escalate with peak
//! tracking, debounced metric updates, reopen within a grace window, and
//! quorum-based auto-resolve. Every mutation commits its head row together
//! with its event row through the store.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sentinel_store::{
    Alert, AlertConfig, AlertConfigStore, AlertEnrichment, AlertEvent, AlertEventType,
    AlertMetrics, AlertSeverity, AlertStatus, AlertStore, AlertType, AssignmentStore, PairState,
    PairStateStore, PairStatus, Store, SubnetStore, Target, TargetId, TargetStore,
};

use crate::correlation::correlation_key;
use crate::metrics;
use crate::types::{auto_resolve_quorum, AlertTickSummary, AlertingConfig, AlertingError, AnomalySignal};

const WORKER: &str = "alert_worker";

pub struct AlertEngine {
    store: Arc<dyn Store>,
    config: AlertingConfig,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, config: AlertingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AlertingConfig {
        &self.config
    }

    /// One engine tick: derive signals, evolve or create alerts, then
    /// auto-resolve targets that enough agents see healthy again.
    pub async fn run_tick(&self) -> Result<AlertTickSummary, AlertingError> {
        let alert_config = self.store.get_alert_config().await?;
        let targets: HashMap<TargetId, Target> = self
            .store
            .list_targets()
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let signals = self.derive_signals(&targets).await?;
        let mut summary = AlertTickSummary {
            signals: signals.len(),
            ..AlertTickSummary::default()
        };

        for signal in &signals {
            let Some(target) = targets.get(&signal.target_id) else { continue };
            self.apply_signal(signal, target, &alert_config, &mut summary).await?;
        }

        summary.auto_resolved = self.auto_resolve(&targets, &alert_config).await?;
        metrics::record_tick(&summary);
        debug!(
            signals = summary.signals,
            created = summary.created,
            resolved = summary.auto_resolved,
            "alert tick complete"
        );
        Ok(summary)
    }

    /// Derive anomaly signals from current non-healthy pair states. A
    /// target with several anomalous agents collapses into one consensus
    /// signal; a single anomalous agent yields a per-agent signal.
    async fn derive_signals(
        &self,
        targets: &HashMap<TargetId, Target>,
    ) -> Result<Vec<AnomalySignal>, AlertingError> {
        let states = self.store.list_non_healthy_states().await?;
        let mut by_target: HashMap<TargetId, Vec<PairState>> = HashMap::new();
        for state in states {
            by_target.entry(state.target_id).or_default().push(state);
        }

        let mut signals = Vec::new();
        for (target_id, states) in by_target {
            let Some(target) = targets.get(&target_id) else { continue };
            if target.archived_at.is_some() || !target.monitoring_state.is_alertable() {
                continue;
            }

            if states.len() >= self.config.consensus_min_agents {
                let severity = states
                    .iter()
                    .map(|s| self.severity_of(s, target))
                    .max()
                    .unwrap_or(AlertSeverity::Warning);
                let worst = states
                    .iter()
                    .max_by_key(|s| (s.status == PairStatus::Down, s.current_packet_loss as i64))
                    .expect("non-empty state set");
                signals.push(AnomalySignal {
                    target_id,
                    agent_id: None,
                    alert_type: self.type_of(worst, target),
                    severity,
                    metrics: Self::metrics_of(worst),
                });
            } else {
                for state in &states {
                    signals.push(AnomalySignal {
                        target_id,
                        agent_id: Some(state.agent_id),
                        alert_type: self.type_of(state, target),
                        severity: self.severity_of(state, target),
                        metrics: Self::metrics_of(state),
                    });
                }
            }
        }
        Ok(signals)
    }

    fn type_of(&self, state: &PairState, target: &Target) -> AlertType {
        if let Some(expected) = &target.expected_outcome {
            if !expected.should_succeed {
                return AlertType::UnexpectedState;
            }
        }
        if state.status == PairStatus::Down {
            AlertType::TargetDown
        } else if state.current_packet_loss > 1.0 {
            AlertType::PacketLoss
        } else {
            AlertType::LatencyAnomaly
        }
    }

    fn severity_of(&self, state: &PairState, target: &Target) -> AlertSeverity {
        if let Some(expected) = &target.expected_outcome {
            if !expected.should_succeed {
                return expected.severity;
            }
        }
        if state.status == PairStatus::Down
            || state.current_packet_loss >= self.config.critical_loss_pct
            || state
                .current_z_score
                .map(|z| z >= self.config.critical_zscore)
                .unwrap_or(false)
        {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }

    fn metrics_of(state: &PairState) -> AlertMetrics {
        AlertMetrics {
            z_score: state.current_z_score,
            latency_ms: state.current_latency_ms,
            packet_loss_pct: state.current_packet_loss,
        }
    }

    async fn apply_signal(
        &self,
        signal: &AnomalySignal,
        target: &Target,
        config: &AlertConfig,
        summary: &mut AlertTickSummary,
    ) -> Result<(), AlertingError> {
        let now = Utc::now();

        if let Some(mut alert) = self
            .store
            .find_active_alert(signal.target_id, signal.alert_type, signal.agent_id)
            .await?
        {
            self.evolve(&mut alert, signal, config, summary).await?;
            return Ok(());
        }

        // A recent resolution reopens instead of spawning a parallel alert.
        let reopen_floor = now - Duration::seconds(config.reopen_window_secs);
        if let Some(mut alert) = self
            .store
            .find_recently_resolved_alert(
                signal.target_id,
                signal.alert_type,
                signal.agent_id,
                reopen_floor,
            )
            .await?
        {
            let mut event = AlertEvent::new(
                alert.id,
                AlertEventType::Reopened,
                "anomaly recurred within the reopen window",
                WORKER,
                now,
            );
            event.old_status = Some(alert.status);
            event.new_status = Some(AlertStatus::Active);
            event.metrics = Some(signal.metrics);
            alert.status = AlertStatus::Active;
            alert.resolved_at = None;
            alert.severity = signal.severity;
            alert.peak_severity = alert.peak_severity.max(signal.severity);
            alert.metrics = signal.metrics;
            alert.last_updated_at = now;
            self.store.update_alert(&alert, Some(event)).await?;
            summary.reopened += 1;
            return Ok(());
        }

        // Fresh alert: snapshot enrichment by IP containment for fidelity
        // even if the subnet record changes later.
        let enrichment = match self.store.find_subnet_containing(target.ip).await? {
            Some(subnet) => AlertEnrichment {
                subnet_id: Some(subnet.id),
                subnet_cidr: Some(subnet.cidr.to_string()),
                subscriber: subnet.subscriber.clone(),
                pop: subnet.pop.clone(),
                gateway_device: subnet.gateway_device.clone(),
                location: subnet.location.clone(),
                region: subnet.region.clone(),
            },
            None => AlertEnrichment::default(),
        };

        let alert_id = Uuid::new_v4();
        let alert = Alert {
            id: alert_id,
            target_id: signal.target_id,
            agent_id: signal.agent_id,
            alert_type: signal.alert_type,
            severity: signal.severity,
            initial_severity: signal.severity,
            peak_severity: signal.severity,
            status: AlertStatus::Active,
            metrics: signal.metrics,
            initial_metrics: signal.metrics,
            peak_metrics: signal.metrics,
            detected_at: now,
            last_updated_at: now,
            resolved_at: None,
            acknowledged_at: None,
            correlation_key: correlation_key(target),
            incident_id: None,
            enrichment,
            last_escalated_at: None,
        };
        let mut event = AlertEvent::new(alert_id, AlertEventType::Created, "anomaly detected", WORKER, now);
        event.new_severity = Some(signal.severity);
        event.new_status = Some(AlertStatus::Active);
        event.metrics = Some(signal.metrics);
        self.store.create_alert(alert, event).await?;
        summary.created += 1;
        Ok(())
    }

    /// Evolve an existing alert: escalate, de-escalate (outside the
    /// cooldown window) or update metrics with debounce.
    async fn evolve(
        &self,
        alert: &mut Alert,
        signal: &AnomalySignal,
        config: &AlertConfig,
        summary: &mut AlertTickSummary,
    ) -> Result<(), AlertingError> {
        let now = Utc::now();
        let new_metrics = signal.metrics;
        let peak = AlertMetrics {
            z_score: max_opt(alert.peak_metrics.z_score, new_metrics.z_score),
            latency_ms: max_opt(alert.peak_metrics.latency_ms, new_metrics.latency_ms),
            packet_loss_pct: alert
                .peak_metrics
                .packet_loss_pct
                .max(new_metrics.packet_loss_pct),
        };

        if signal.severity > alert.severity {
            let mut event = AlertEvent::new(
                alert.id,
                AlertEventType::Escalated,
                format!("{:?} -> {:?}", alert.severity, signal.severity),
                WORKER,
                now,
            );
            event.old_severity = Some(alert.severity);
            event.new_severity = Some(signal.severity);
            event.metrics = Some(new_metrics);

            alert.severity = signal.severity;
            alert.peak_severity = alert.peak_severity.max(signal.severity);
            alert.metrics = new_metrics;
            alert.peak_metrics = peak;
            alert.last_updated_at = now;
            alert.last_escalated_at = Some(now);
            self.store.update_alert(alert, Some(event)).await?;
            summary.escalated += 1;
            return Ok(());
        }

        if signal.severity < alert.severity {
            // Inside the cooldown after an escalation this records only a
            // metric update, avoiding flappy severity churn.
            let cooling = alert
                .last_escalated_at
                .map(|at| now - at < Duration::seconds(config.de_escalation_window_secs))
                .unwrap_or(false);
            if !cooling {
                let mut event = AlertEvent::new(
                    alert.id,
                    AlertEventType::DeEscalated,
                    format!("{:?} -> {:?}", alert.severity, signal.severity),
                    WORKER,
                    now,
                );
                event.old_severity = Some(alert.severity);
                event.new_severity = Some(signal.severity);
                event.metrics = Some(new_metrics);

                alert.severity = signal.severity; // peak stays
                alert.metrics = new_metrics;
                alert.peak_metrics = peak;
                alert.last_updated_at = now;
                self.store.update_alert(alert, Some(event)).await?;
                summary.de_escalated += 1;
                return Ok(());
            }
        }

        // Same severity (or cooled de-escalation): head row always tracks
        // current metrics; the event stream stays quiet inside the debounce.
        let debounced = now - alert.last_updated_at
            < Duration::seconds(config.metric_update_debounce_secs);
        let event = if debounced {
            None
        } else {
            let mut event = AlertEvent::new(
                alert.id,
                AlertEventType::MetricsUpdated,
                "periodic metrics refresh",
                WORKER,
                now,
            );
            event.metrics = Some(new_metrics);
            Some(event)
        };
        alert.metrics = new_metrics;
        alert.peak_metrics = peak;
        alert.last_updated_at = now;
        self.store.update_alert(alert, event).await?;
        Ok(())
    }

    /// Resolve every alert on targets that enough assigned agents see
    /// healthy. Quorums are tier-specific.
    async fn auto_resolve(
        &self,
        targets: &HashMap<TargetId, Target>,
        config: &AlertConfig,
    ) -> Result<usize, AlertingError> {
        let now = Utc::now();
        let mut resolved = 0;

        for target_id in self.store.targets_with_active_alerts().await? {
            let Some(target) = targets.get(&target_id) else { continue };
            let assigned = self.store.agents_assigned_to_target(target_id).await?;
            if assigned.is_empty() {
                continue;
            }
            let states = self.store.states_for_target(target_id).await?;
            let healthy = assigned
                .iter()
                .filter(|agent_id| {
                    states
                        .iter()
                        .any(|s| s.agent_id == **agent_id && s.status == PairStatus::Healthy)
                })
                .count();
            let any_unhealthy = states
                .iter()
                .any(|s| matches!(s.status, PairStatus::Degraded | PairStatus::Down));
            let quorum = auto_resolve_quorum(
                &target.tier,
                assigned.len(),
                config.auto_resolve_min_healthy,
            );
            if any_unhealthy || healthy < quorum {
                continue;
            }

            for mut alert in self
                .store
                .alerts_for_target(target_id, &[AlertStatus::Active, AlertStatus::Acknowledged])
                .await?
            {
                let mut event = AlertEvent::new(
                    alert.id,
                    AlertEventType::Resolved,
                    format!("{healthy}/{} monitoring agents healthy", assigned.len()),
                    WORKER,
                    now,
                );
                event.old_status = Some(alert.status);
                event.new_status = Some(AlertStatus::Resolved);
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                alert.last_updated_at = now;
                self.store.update_alert(&alert, Some(event)).await?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Operator action. Acknowledging an acknowledged alert is a no-op
    /// (no new event); evolution continues afterwards.
    pub async fn acknowledge(&self, alert_id: Uuid, by: &str) -> Result<Alert, AlertingError> {
        let mut alert = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("alert"))?;
        if alert.status == AlertStatus::Acknowledged {
            return Ok(alert);
        }
        if alert.status == AlertStatus::Resolved {
            return Err(AlertingError::Store(sentinel_store::StoreError::Conflict(
                "cannot acknowledge a resolved alert".to_string(),
            )));
        }
        let now = Utc::now();
        let mut event = AlertEvent::new(alert_id, AlertEventType::Acknowledged, "", by, now);
        event.old_status = Some(alert.status);
        event.new_status = Some(AlertStatus::Acknowledged);
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.last_updated_at = now;
        self.store.update_alert(&alert, Some(event)).await?;
        Ok(alert)
    }

    /// Operator action: resolve directly. Terminal; recurrence within the
    /// grace window reopens the same alert id.
    pub async fn resolve(&self, alert_id: Uuid, by: &str) -> Result<Alert, AlertingError> {
        let mut alert = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or(sentinel_store::StoreError::NotFound("alert"))?;
        if alert.status == AlertStatus::Resolved {
            return Ok(alert);
        }
        let now = Utc::now();
        let mut event = AlertEvent::new(alert_id, AlertEventType::Resolved, "", by, now);
        event.old_status = Some(alert.status);
        event.new_status = Some(AlertStatus::Resolved);
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.last_updated_at = now;
        self.store.update_alert(&alert, Some(event)).await?;
        Ok(alert)
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Periodic alert engine loop.
pub async fn run_alert_worker(
    engine: Arc<AlertEngine>,
    token: CancellationToken,
) -> Result<(), AlertingError> {
    let mut tick = interval(StdDuration::from_secs(engine.config().tick_secs));
    info!(tick_secs = engine.config().tick_secs, "alert engine started");
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = engine.run_tick().await {
            warn!(error = %e, "alert tick failed");
        }
    }
    info!("alert engine stopped");
    Ok(())
}
