//! Short-TTL read cache for the heavy read paths (fleet overview, target
//! list, hot spots). Entries expire by wall time only; nothing correctness-
//! critical ever depends on a hit.

use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::platform::config::CacheSettings;

pub enum ReadCache {
    Off,
    Memory(Mutex<HashMap<String, (Instant, Value)>>),
    Redis(redis::aio::ConnectionManager),
}

impl ReadCache {
    pub async fn from_settings(settings: &CacheSettings) -> Self {
        match settings.backend.as_str() {
            "redis" => match redis::Client::open(settings.redis_url.as_str()) {
                Ok(client) => match client.get_tokio_connection_manager().await {
                    Ok(manager) => ReadCache::Redis(manager),
                    Err(e) => {
                        warn!(error = %e, "redis unavailable, read cache disabled");
                        ReadCache::Off
                    }
                },
                Err(e) => {
                    warn!(error = %e, "bad redis url, read cache disabled");
                    ReadCache::Off
                }
            },
            "memory" => ReadCache::Memory(Mutex::new(HashMap::new())),
            _ => ReadCache::Off,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        match self {
            ReadCache::Off => None,
            ReadCache::Memory(entries) => {
                let mut entries = entries.lock().await;
                match entries.get(key) {
                    Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
                    Some(_) => {
                        entries.remove(key);
                        None
                    }
                    None => None,
                }
            }
            ReadCache::Redis(manager) => {
                let mut conn = manager.clone();
                let raw: Option<String> = conn.get(key).await.ok().flatten();
                raw.and_then(|s| serde_json::from_str(&s).ok())
            }
        }
    }

    pub async fn put(&self, key: &str, value: Value, ttl: Duration) {
        match self {
            ReadCache::Off => {}
            ReadCache::Memory(entries) => {
                entries
                    .lock()
                    .await
                    .insert(key.to_string(), (Instant::now() + ttl, value));
            }
            ReadCache::Redis(manager) => {
                let mut conn = manager.clone();
                let raw = value.to_string();
                let outcome: Result<(), _> =
                    conn.set_ex(key, raw, ttl.as_secs()).await;
                if let Err(e) = outcome {
                    warn!(error = %e, "cache write failed");
                }
            }
        }
    }
}
