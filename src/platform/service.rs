//! Worker registration: each background concern registers a named spawner
//! that the runtime starts with the shared context and a child
//! cancellation token, and joins on shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::platform::context::PlatformContext;

pub type WorkerSpawner = Arc<
    dyn Fn(PlatformContext, CancellationToken) -> JoinHandle<Result<()>> + Send + Sync + 'static,
>;

pub struct WorkerRegistration {
    name: String,
    spawner: WorkerSpawner,
}

impl WorkerRegistration {
    pub fn new<N: Into<String>>(name: N, spawner: WorkerSpawner) -> Self {
        Self {
            name: name.into(),
            spawner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn(
        &self,
        context: PlatformContext,
        token: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        (self.spawner)(context, token)
    }
}
