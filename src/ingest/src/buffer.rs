//! # Result Buffer
//!
//! Bounded staging layer between the agent ingest surface and the store.
//! Agents enqueue `ResultBatch` values; a flush worker drains the buffer
//! into large bulk inserts every `flush_interval_secs` or as soon as
//! `flush_batch_size` results are waiting. When the buffer is full,
//! `enqueue` fails fast with a retryable error and the caller translates it
//! into a retryable response for the agent.
//!
//! Delivery is at-least-once at this edge (agents retry on timeout) and
//! at-most-once inside the store, which absorbs duplicates on
//! (time, target, agent).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sentinel_store::{ProbeResult, ResultBatch, ResultStore, Store};

use crate::metrics;
use crate::types::{IngestConfig, IngestError};

pub struct ResultBuffer {
    buffered: Mutex<VecDeque<ProbeResult>>,
    flush_signal: Notify,
    config: IngestConfig,
}

impl ResultBuffer {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            buffered: Mutex::new(VecDeque::new()),
            flush_signal: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Stage a batch. The batch's agent id is stamped onto every result so
    /// a misbehaving agent cannot attribute results to another.
    pub async fn enqueue(&self, batch: ResultBatch) -> Result<(), IngestError> {
        let mut buffered = self.buffered.lock().await;
        if buffered.len() + batch.results.len() > self.config.buffer_capacity {
            metrics::record_rejected_batch(batch.results.len());
            return Err(IngestError::BufferFull {
                buffered: buffered.len(),
                capacity: self.config.buffer_capacity,
            });
        }
        for mut result in batch.results {
            result.agent_id = batch.agent_id;
            buffered.push_back(result);
        }
        let depth = buffered.len();
        drop(buffered);

        metrics::set_buffer_depth(depth);
        if depth >= self.config.flush_batch_size {
            self.flush_signal.notify_one();
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.buffered.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffered.lock().await.is_empty()
    }

    /// Take up to `max` results off the front.
    async fn drain(&self, max: usize) -> Vec<ProbeResult> {
        let mut buffered = self.buffered.lock().await;
        let n = buffered.len().min(max);
        let drained: Vec<ProbeResult> = buffered.drain(..n).collect();
        metrics::set_buffer_depth(buffered.len());
        drained
    }

    /// Put a failed flush back at the front, capacity permitting. Overflow
    /// is dropped with a warning; the agent-side retry will resupply.
    async fn requeue_front(&self, results: Vec<ProbeResult>) {
        let mut buffered = self.buffered.lock().await;
        let space = self.config.buffer_capacity.saturating_sub(buffered.len());
        let kept = results.len().min(space);
        if kept < results.len() {
            warn!(
                dropped = results.len() - kept,
                "buffer overflow on requeue, dropping oldest staged results"
            );
        }
        for result in results.into_iter().take(kept).rev() {
            buffered.push_front(result);
        }
        metrics::set_buffer_depth(buffered.len());
    }
}

/// Flush loop: drains the buffer into bulk inserts until cancelled, then
/// performs one bounded best-effort drain.
pub async fn run_flush_loop(
    buffer: Arc<ResultBuffer>,
    store: Arc<dyn Store>,
    token: CancellationToken,
) -> Result<(), IngestError> {
    let config = buffer.config().clone();
    let mut tick = interval(Duration::from_secs(config.flush_interval_secs));
    {
        info!(
            interval_secs = config.flush_interval_secs,
            batch_size = config.flush_batch_size,
            "result flush worker started"
        );
    }

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = buffer.flush_signal.notified() => {}
            _ = token.cancelled() => break,
        }
        if let Err(e) = flush_once(&buffer, store.as_ref(), config.flush_batch_size).await {
            if e.is_retryable() {
                warn!(error = %e, "flush deferred, will retry next tick");
            } else {
                error!(error = %e, "flush failed");
            }
        }
    }

    // Shutdown: drain what we can inside the deadline.
    let deadline = Instant::now() + Duration::from_secs(config.shutdown_drain_secs);
    while !buffer.is_empty().await {
        match timeout_at(
            deadline,
            flush_once(&buffer, store.as_ref(), config.flush_batch_size),
        )
        .await
        {
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "shutdown drain flush failed");
                break;
            }
            Err(_) => {
                let remaining = buffer.len().await;
                warn!(
                    remaining,
                    "shutdown drain deadline reached, dropping staged results"
                );
                break;
            }
        }
    }
    info!("result flush worker stopped");
    Ok(())
}

/// One drain-and-insert cycle. On a retryable store failure the drained
/// results go back to the front of the buffer.
pub async fn flush_once(
    buffer: &ResultBuffer,
    store: &dyn Store,
    batch_size: usize,
) -> Result<u64, IngestError> {
    let drained = buffer.drain(batch_size).await;
    if drained.is_empty() {
        return Ok(0);
    }
    let count = drained.len();
    let timer = metrics::flush_timer();

    match store.bulk_insert_results(drained.clone()).await {
        Ok(inserted) => {
            drop(timer);
            metrics::record_flush(count, inserted);
            debug!(staged = count, inserted, "flushed result batch");
            Ok(inserted)
        }
        Err(e) if e.is_retryable() => {
            buffer.requeue_front(drained).await;
            Err(IngestError::Store(e))
        }
        Err(e) => Err(IngestError::Store(e)),
    }
}
