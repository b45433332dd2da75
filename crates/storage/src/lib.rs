//! Durable storage for undelivered telemetry batches.
//!
//! This crate provides the [`StorageAdapter`] key-value contract, three
//! adapters (SQLite record store, JSON files, memory) and the
//! [`StorageManager`] that keeps batches under a byte cap.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;
pub mod manager;

#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

use std::sync::Arc;

use effm_core::{StorageBackend, StorageConfig};
use tracing::warn;

pub use trait_::{StorageAdapter, StorageError, Result};
pub use json_storage::JsonFileStore;
pub use memory::MemoryStore;
pub use manager::{
    EvictedBatch, StorageManager, StorageRecord, StorageStats, StoreOutcome, KEY_PREFIX,
};

#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStore;

/// File name of the SQLite database inside `storage.path`.
pub const SQLITE_FILE: &str = "effm.db";

/// Open the adapter selected by `config.backend`.
///
/// `Auto` prefers the SQLite record store and falls back to JSON files when
/// it cannot be opened.
pub async fn open_adapter(config: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Json => Ok(Arc::new(JsonFileStore::new(&config.path, &config.namespace).await?)),
        StorageBackend::Sqlite => open_sqlite(config).await,
        StorageBackend::Auto => match open_sqlite(config).await {
            Ok(adapter) => Ok(adapter),
            Err(e) => {
                warn!("Record store unavailable ({}), falling back to JSON files", e);
                Ok(Arc::new(JsonFileStore::new(&config.path, &config.namespace).await?))
            }
        },
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(config: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    let store = SqliteStore::open(&config.path.join(SQLITE_FILE), &config.namespace).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_config: &StorageConfig) -> Result<Arc<dyn StorageAdapter>> {
    Err(StorageError::Unavailable("built without the sqlite feature".to_string()))
}
