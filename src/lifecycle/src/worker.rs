//! Periodic lifecycle worker: transition scans plus representative
//! election on a slower cadence.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::LifecycleManager;
use crate::types::LifecycleError;

pub async fn run_lifecycle_worker(
    manager: Arc<LifecycleManager>,
    token: CancellationToken,
) -> Result<(), LifecycleError> {
    let config = manager.config().clone();
    let mut scan_tick = interval(Duration::from_secs(config.scan_interval_secs));
    let mut election_tick = interval(Duration::from_secs(config.election_interval_secs));
    info!(
        scan_secs = config.scan_interval_secs,
        election_secs = config.election_interval_secs,
        "lifecycle worker started"
    );

    loop {
        tokio::select! {
            _ = scan_tick.tick() => {
                match manager.run_transition_scan().await {
                    Ok(moved) if moved > 0 => debug!(moved, "lifecycle transitions applied"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "transition scan failed"),
                }
            }
            _ = election_tick.tick() => {
                match manager.run_representative_election().await {
                    Ok(elected) if elected > 0 => debug!(elected, "representatives elected"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "representative election failed"),
                }
            }
            _ = token.cancelled() => break,
        }
    }
    info!("lifecycle worker stopped");
    Ok(())
}
