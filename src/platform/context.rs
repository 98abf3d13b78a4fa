use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sentinel_alerting::AlertEngine;
use sentinel_assignment::AssignmentEngine;
use sentinel_evaluator::Evaluator;
use sentinel_fleet::FleetRegistry;
use sentinel_incidents::IncidentCorrelator;
use sentinel_ingest::ResultBuffer;
use sentinel_lifecycle::LifecycleManager;
use sentinel_store::Store;

use crate::platform::cache::ReadCache;
use crate::platform::config::PlatformConfig;

#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: PlatformConfig,
    store: Arc<dyn Store>,
    buffer: Arc<ResultBuffer>,
    registry: Arc<FleetRegistry>,
    lifecycle: Arc<LifecycleManager>,
    assignment: Arc<AssignmentEngine>,
    evaluator: Arc<Evaluator>,
    alerts: Arc<AlertEngine>,
    incidents: Arc<IncidentCorrelator>,
    cache: Arc<ReadCache>,
}

impl PlatformContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PlatformConfig,
        store: Arc<dyn Store>,
        buffer: Arc<ResultBuffer>,
        registry: Arc<FleetRegistry>,
        lifecycle: Arc<LifecycleManager>,
        assignment: Arc<AssignmentEngine>,
        evaluator: Arc<Evaluator>,
        alerts: Arc<AlertEngine>,
        incidents: Arc<IncidentCorrelator>,
        cache: Arc<ReadCache>,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            store,
            buffer,
            registry,
            lifecycle,
            assignment,
            evaluator,
            alerts,
            incidents,
            cache,
        };
        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.shared.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.shared.store)
    }

    pub fn buffer(&self) -> Arc<ResultBuffer> {
        Arc::clone(&self.shared.buffer)
    }

    pub fn registry(&self) -> Arc<FleetRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        Arc::clone(&self.shared.lifecycle)
    }

    pub fn assignment(&self) -> Arc<AssignmentEngine> {
        Arc::clone(&self.shared.assignment)
    }

    pub fn evaluator(&self) -> Arc<Evaluator> {
        Arc::clone(&self.shared.evaluator)
    }

    pub fn alerts(&self) -> Arc<AlertEngine> {
        Arc::clone(&self.shared.alerts)
    }

    pub fn incidents(&self) -> Arc<IncidentCorrelator> {
        Arc::clone(&self.shared.incidents)
    }

    pub fn cache(&self) -> Arc<ReadCache> {
        Arc::clone(&self.shared.cache)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
