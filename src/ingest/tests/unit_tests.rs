//! # Ingest Unit Tests

use chrono::{Duration, Utc};
use sentinel_ingest::*;
use sentinel_store::{MemoryStore, ProbeResult, ResultBatch, ResultStore};
use std::sync::Arc;
use uuid::Uuid;

fn batch(agent_id: Uuid, count: usize) -> ResultBatch {
    let now = Utc::now();
    ResultBatch {
        agent_id,
        batch_id: Uuid::new_v4(),
        results: (0..count)
            .map(|i| ProbeResult {
                time: now - Duration::milliseconds(i as i64),
                target_id: Uuid::new_v4(),
                agent_id: Uuid::nil(), // buffer must stamp the batch agent
                success: true,
                error: None,
                latency_ms: Some(10.0),
                packet_loss_pct: Some(0.0),
                payload: None,
                agent_region: None,
                target_region: None,
                is_in_market: false,
            })
            .collect(),
    }
}

#[tokio::test]
async fn enqueue_fails_fast_when_full() {
    let buffer = ResultBuffer::new(IngestConfig {
        buffer_capacity: 10,
        ..IngestConfig::default()
    });
    let agent = Uuid::new_v4();
    buffer.enqueue(batch(agent, 8)).await.unwrap();

    let err = buffer.enqueue(batch(agent, 5)).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, IngestError::BufferFull { buffered: 8, .. }));

    // A batch that still fits is accepted.
    buffer.enqueue(batch(agent, 2)).await.unwrap();
    assert_eq!(buffer.len().await, 10);
}

#[tokio::test]
async fn flush_moves_results_to_store() {
    let buffer = ResultBuffer::new(IngestConfig::default());
    let store = Arc::new(MemoryStore::new());
    let agent = Uuid::new_v4();

    buffer.enqueue(batch(agent, 50)).await.unwrap();
    let inserted = flush_once(&buffer, store.as_ref(), 20_000).await.unwrap();
    assert_eq!(inserted, 50);
    assert!(buffer.is_empty().await);

    let pairs = store
        .active_pairs_since(Utc::now() - Duration::seconds(60))
        .await
        .unwrap();
    // Targets are unknown to the store so no live pairs, but the rows exist.
    assert!(pairs.is_empty());
}

#[tokio::test]
async fn batch_agent_id_is_stamped() {
    let buffer = ResultBuffer::new(IngestConfig::default());
    let store = Arc::new(MemoryStore::new());
    let agent = Uuid::new_v4();
    let target = Uuid::new_v4();

    let mut b = batch(agent, 1);
    b.results[0].target_id = target;
    buffer.enqueue(b).await.unwrap();
    flush_once(&buffer, store.as_ref(), 100).await.unwrap();

    // The row is attributed to the batch agent, not the nil id the result
    // arrived with.
    let stats = store
        .bulk_pair_window_stats(
            &[sentinel_store::PairKey {
                agent_id: agent,
                target_id: target,
            }],
            Utc::now() - Duration::seconds(60),
        )
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].sample_count, 1);
}

#[tokio::test]
async fn duplicate_shipment_is_idempotent() {
    let buffer = ResultBuffer::new(IngestConfig::default());
    let store = Arc::new(MemoryStore::new());
    let agent = Uuid::new_v4();

    let b = batch(agent, 10);
    buffer.enqueue(b.clone()).await.unwrap();
    let first = flush_once(&buffer, store.as_ref(), 100).await.unwrap();
    assert_eq!(first, 10);

    // Agent retried after a timeout: same rows, zero new inserts.
    buffer.enqueue(b).await.unwrap();
    let second = flush_once(&buffer, store.as_ref(), 100).await.unwrap();
    assert_eq!(second, 0);
}
