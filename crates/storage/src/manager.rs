//! Durable, bounded persistence of undelivered batches.
//!
//! Every batch is written under its own `events_<millis>` key, so a delivered
//! batch is removed on its own without rewriting anything else. Keys are
//! zero-padded so lexical key order is storage order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use effm_core::{now_millis, Batch, Event};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::trait_::{Result, StorageAdapter, StorageError};

/// Prefix of every key this subsystem writes.
pub const KEY_PREFIX: &str = "events_";

/// One stored batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord {
    /// Storage key
    pub key: String,
    /// Stored batch
    pub batch: Batch,
    /// When the batch was stored, milliseconds since epoch
    pub stored_at: i64,
}

/// A batch dropped to keep the store under its cap.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedBatch {
    /// Key it was stored under
    pub key: String,
    /// Events lost (empty if the record could not be parsed)
    pub events: Vec<Event>,
    /// Serialized size
    pub bytes: u64,
}

/// Result of [`StorageManager::store_batch`].
#[derive(Debug)]
pub struct StoreOutcome {
    /// Key the batch was written under
    pub key: String,
    /// Batches evicted by this write, oldest first
    pub evicted: Vec<EvictedBatch>,
    /// Eviction stopped on this error; the batch itself is stored
    pub eviction_error: Option<StorageError>,
}

impl StoreOutcome {
    /// Whether the stored batch itself survived eviction.
    pub fn retained(&self) -> bool {
        !self.evicted.iter().any(|e| e.key == self.key)
    }
}

/// Summary of what is currently stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Backend name
    pub backend: String,
    /// Stored batches
    pub batch_count: usize,
    /// Events across all stored batches
    pub event_count: usize,
    /// Estimated serialized size
    pub total_bytes: u64,
    /// Configured cap
    pub max_bytes: u64,
    /// `total_bytes / max_bytes` as a percentage
    pub usage_percentage: f64,
}

/// Parse the storage timestamp out of a key.
pub fn stored_at_from_key(key: &str) -> Option<i64> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

fn key_for(millis: i64) -> String {
    format!("{}{:013}", KEY_PREFIX, millis)
}

/// Storage manager over any [`StorageAdapter`].
pub struct StorageManager {
    adapter: Arc<dyn StorageAdapter>,
    max_bytes: AtomicU64,
    /// Serializes mutations; holds the last timestamp handed out as a key.
    write_lock: Mutex<i64>,
}

impl StorageManager {
    /// Create a manager with a byte cap.
    pub fn new(adapter: Arc<dyn StorageAdapter>, max_bytes: u64) -> Self {
        Self {
            adapter,
            max_bytes: AtomicU64::new(max_bytes),
            write_lock: Mutex::new(0),
        }
    }

    /// Backend name.
    pub fn backend(&self) -> &'static str {
        self.adapter.name()
    }

    /// Current byte cap.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    /// Change the byte cap; applies from the next write.
    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    /// Persist a batch under a fresh key, then evict past the cap.
    pub async fn store_batch(&self, batch: &Batch) -> Result<StoreOutcome> {
        let value = serde_json::to_string(batch)?;
        let mut last = self.write_lock.lock().await;

        let mut stamp = now_millis().max(*last + 1);
        let mut key = key_for(stamp);
        while self.adapter.get(&key).await?.is_some() {
            stamp += 1;
            key = key_for(stamp);
        }
        self.adapter.set(&key, &value).await?;
        *last = stamp;
        debug!("Stored batch {} ({} events) as {}", batch.batch_id(), batch.len(), key);

        let mut evicted = Vec::new();
        let eviction_error = self.evict_locked(&key, &mut evicted).await.err();
        if let Some(e) = &eviction_error {
            error!("Stored {} but could not enforce the storage cap: {}", key, e);
        }
        Ok(StoreOutcome { key, evicted, eviction_error })
    }

    /// Drop oldest batches until the store fits its cap.
    ///
    /// The just-written batch is only dropped when it alone exceeds the cap.
    /// Evicted batches are pushed as they go, so `evicted` is accurate
    /// even when this returns an error.
    async fn evict_locked(&self, newest: &str, evicted: &mut Vec<EvictedBatch>) -> Result<()> {
        let max = self.max_bytes();
        let mut sized = Vec::new();
        let mut total = 0u64;
        for key in self.own_keys().await? {
            if let Some(value) = self.adapter.get(&key).await? {
                total += value.len() as u64;
                sized.push((key, value));
            }
        }
        if total <= max {
            return Ok(());
        }

        let (older, newer): (Vec<_>, Vec<_>) = sized.into_iter().partition(|(k, _)| k != newest);
        for (key, value) in older.into_iter().chain(newer) {
            if total <= max {
                break;
            }
            let bytes = value.len() as u64;
            self.adapter.remove(&key).await?;
            total -= bytes;
            let events = serde_json::from_str::<Batch>(&value)
                .map(Batch::into_events)
                .unwrap_or_default();
            error!(
                "Evicted stored batch {} ({} events, {} bytes): storage cap of {} bytes exceeded",
                key,
                events.len(),
                bytes,
                max
            );
            evicted.push(EvictedBatch { key, events, bytes });
        }
        Ok(())
    }

    async fn own_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .adapter
            .keys()
            .await?
            .into_iter()
            .filter(|k| stored_at_from_key(k).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// All stored batches in storage order. Unreadable records are skipped.
    pub async fn records(&self) -> Result<Vec<StorageRecord>> {
        let mut records = Vec::new();
        for key in self.own_keys().await? {
            let Some(value) = self.adapter.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Batch>(&value) {
                Ok(batch) => records.push(StorageRecord {
                    stored_at: stored_at_from_key(&key).unwrap_or_default(),
                    key,
                    batch,
                }),
                Err(e) => warn!("Skipping unreadable stored batch {}: {}", key, e),
            }
        }
        Ok(records)
    }

    /// Every stored event, concatenated in storage order.
    pub async fn all_events(&self) -> Result<Vec<Event>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .flat_map(|r| r.batch.into_events())
            .collect())
    }

    /// Remove one stored batch after confirmed delivery.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.adapter.remove(key).await
    }

    /// Overwrite a stored batch in place (used after partial redelivery).
    pub async fn replace(&self, key: &str, batch: &Batch) -> Result<()> {
        let value = serde_json::to_string(batch)?;
        let _guard = self.write_lock.lock().await;
        self.adapter.set(key, &value).await
    }

    /// Remove every stored batch. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let keys = self.own_keys().await?;
        for key in &keys {
            self.adapter.remove(key).await?;
        }
        Ok(keys.len())
    }

    /// Serialized byte length of everything stored.
    pub async fn estimated_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for key in self.own_keys().await? {
            if let Some(value) = self.adapter.get(&key).await? {
                total += value.len() as u64;
            }
        }
        Ok(total)
    }

    /// Current storage statistics.
    pub async fn stats(&self) -> Result<StorageStats> {
        let records = self.records().await?;
        let total_bytes = self.estimated_size().await?;
        let max_bytes = self.max_bytes();
        let usage_percentage = if max_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / max_bytes as f64 * 100.0
        };
        Ok(StorageStats {
            backend: self.backend().to_string(),
            batch_count: records.len(),
            event_count: records.iter().map(|r| r.batch.len()).sum(),
            total_bytes,
            max_bytes,
            usage_percentage,
        })
    }
}
