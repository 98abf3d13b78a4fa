//! Worker registrations: one long-lived cancellable task per background
//! concern, all talking through the store. No worker shares mutable state
//! with another.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::interval;
use tracing::warn;

use sentinel_store::{ActivityStore, ResultStore};

use crate::platform::service::WorkerRegistration;

pub fn result_flush_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "result-flush",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_ingest::run_flush_loop(ctx.buffer(), ctx.store(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn fleet_sweeper_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "fleet-sweeper",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                let config = ctx.config().fleet.to_config();
                sentinel_fleet::run_status_sweeper(ctx.store(), config, token).await?;
                Ok(())
            })
        }),
    )
}

pub fn lifecycle_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "lifecycle",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_lifecycle::run_lifecycle_worker(ctx.lifecycle(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn assignment_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "assignment",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_assignment::run_assignment_worker(ctx.assignment(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn evaluator_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "evaluator",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_evaluator::run_evaluator_worker(ctx.evaluator(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn baseline_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "baseline-recalc",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_evaluator::run_baseline_worker(ctx.evaluator(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn alert_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "alert-engine",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_alerting::run_alert_worker(ctx.alerts(), token).await?;
                Ok(())
            })
        }),
    )
}

pub fn incident_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "incident-correlator",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                sentinel_incidents::run_incident_worker(ctx.incidents(), token).await?;
                Ok(())
            })
        }),
    )
}

/// Retention sweeper: prunes raw probe results and the activity log past
/// their configured horizons.
pub fn retention_service() -> WorkerRegistration {
    WorkerRegistration::new(
        "retention",
        Arc::new(|ctx, token| {
            tokio::spawn(async move {
                let settings = ctx.config().retention.clone();
                let store = ctx.store();
                let mut tick = interval(Duration::from_secs(settings.sweep_interval_secs));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = token.cancelled() => break,
                    }
                    let now = Utc::now();
                    let results_floor = now - chrono::Duration::days(settings.raw_results_days);
                    if let Err(e) = store.prune_results(results_floor).await {
                        warn!(error = %e, "result retention sweep failed");
                    }
                    let activity_floor = now - chrono::Duration::days(settings.activity_log_days);
                    if let Err(e) = store.prune_activity(activity_floor).await {
                        warn!(error = %e, "activity retention sweep failed");
                    }
                }
                Result::Ok(())
            })
        }),
    )
}

/// The full standard worker set.
pub fn standard_services() -> Vec<WorkerRegistration> {
    vec![
        result_flush_service(),
        fleet_sweeper_service(),
        lifecycle_service(),
        assignment_service(),
        evaluator_service(),
        baseline_service(),
        alert_service(),
        incident_service(),
        retention_service(),
    ]
}
