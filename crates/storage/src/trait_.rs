//! Storage adapter abstraction.

use async_trait::async_trait;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error from the record store
    #[error("database error: {0}")]
    Database(String),

    /// Key contains characters the backend cannot address safely
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Requested backend is not compiled in or cannot be opened
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Minimal durable key-value contract used by the storage manager.
///
/// Implementations are scoped to one namespace: `keys` and `clear` never see
/// or touch another namespace's entries. `keys` returns keys in ascending
/// order.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name for logs and status.
    fn name(&self) -> &'static str;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys in ascending order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete every value in the namespace.
    async fn clear(&self) -> Result<()>;
}

/// Keys are used as file names by the file store, so they are restricted to
/// a portable character set.
pub(crate) fn check_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key.len() <= 200
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
