//! Ingest configuration and errors.

use sentinel_store::StoreError;
use thiserror::Error;

/// Result buffer configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Periodic flush interval in seconds
    pub flush_interval_secs: u64,
    /// Buffered results that trigger an early flush
    pub flush_batch_size: usize,
    /// Hard cap on buffered results; beyond it enqueue fails fast
    pub buffer_capacity: usize,
    /// Best-effort drain deadline on shutdown, in seconds
    pub shutdown_drain_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 2,
            flush_batch_size: 20_000,
            buffer_capacity: 100_000,
            shutdown_drain_secs: 10,
        }
    }
}

/// Ingest pipeline errors
#[derive(Debug, Error)]
pub enum IngestError {
    /// Retryable: the agent should back off and resend the batch
    #[error("result buffer full ({buffered} buffered, capacity {capacity})")]
    BufferFull { buffered: usize, capacity: usize },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::BufferFull { .. } => true,
            IngestError::Store(e) => e.is_retryable(),
        }
    }
}
