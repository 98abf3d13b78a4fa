use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sentinel_alerting::AlertEngine;
use sentinel_assignment::AssignmentEngine;
use sentinel_evaluator::Evaluator;
use sentinel_fleet::FleetRegistry;
use sentinel_incidents::IncidentCorrelator;
use sentinel_ingest::ResultBuffer;
use sentinel_lifecycle::LifecycleManager;
use sentinel_store::{MemoryStore, PgStore, Store};

use crate::operations::seed_default_tiers;
use crate::platform::cache::ReadCache;
use crate::platform::config::PlatformConfig;
use crate::platform::context::PlatformContext;
use crate::platform::service::WorkerRegistration;
use crate::platform::telemetry::telemetry_service;
use crate::workers::standard_services;

pub struct Platform {
    config: PlatformConfig,
    services: Vec<WorkerRegistration>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        let mut services = Vec::new();
        services.push(telemetry_service(config.observability.clone()));
        services.extend(standard_services());

        Self { config, services }
    }

    pub fn register_service(&mut self, service: WorkerRegistration) {
        self.services.push(service);
    }

    /// Build the shared context (store, buffer, component services)
    /// without spawning any workers. `start` builds on this; test
    /// harnesses drive the components directly.
    pub async fn build_context(
        config: PlatformConfig,
        root_token: &CancellationToken,
    ) -> Result<PlatformContext> {
        let store: Arc<dyn Store> = match config.store.backend.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            "postgres" => Arc::new(PgStore::connect(&config.store.pg_config()).await?),
            other => bail!("unknown store backend '{other}'"),
        };
        seed_default_tiers(store.as_ref()).await?;

        let buffer = Arc::new(ResultBuffer::new(config.ingest.to_config()));
        let registry = Arc::new(FleetRegistry::new(
            Arc::clone(&store),
            config.fleet.to_config(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            config.lifecycle.to_config(),
        ));
        let assignment = Arc::new(AssignmentEngine::new(
            Arc::clone(&store),
            config.assignment.to_config(),
            config.fleet.liveness(),
        ));
        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&store),
            config.evaluator.to_config(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            Arc::clone(&store),
            config.alerting.to_config(),
        ));
        let incidents = Arc::new(IncidentCorrelator::new(
            Arc::clone(&store),
            config.incidents.to_config(),
        ));
        let cache = Arc::new(ReadCache::from_settings(&config.cache).await);

        Ok(PlatformContext::new(
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
            root_token.child_token(),
        ))
    }

    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let root_token = CancellationToken::new();
        let context = Self::build_context(self.config.clone(), &root_token).await?;

        let mut tasks = Vec::new();
        for service in self.services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!(
            backend = %self.config.store.backend,
            workers = tasks.len(),
            "control plane boot completed"
        );

        Ok(PlatformRuntime {
            context,
            cancel_token: root_token,
            tasks,
        })
    }
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => {
                    return Err(err);
                }
                Err(err) => {
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }
}

fn initialize_logging(config: &PlatformConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}
