//! SQLite storage backend.
//!
//! The transactional record store: one row per key in a `records` table,
//! partitioned by namespace. This is the preferred backend; it handles larger
//! volumes than the file store and every write is a committed transaction.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::trait_::{check_key, Result, StorageAdapter, StorageError};

/// SQLite record store.
#[derive(Clone)]
pub struct SqliteStore {
    /// Database connection pool
    pool: sqlx::SqlitePool,
    namespace: String,
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

impl SqliteStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: &Path, namespace: &str) -> Result<Self> {
        check_key(namespace)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_schema().await?;
        debug!("Opened SQLite record store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// A single connection is kept open for the pool's lifetime, since an
    /// in-memory database disappears with its last connection.
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        check_key(namespace)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO records (namespace, key, value, stored_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at",
        )
        .bind(self.namespace.as_str())
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM records WHERE namespace = ? AND key = ?")
            .bind(self.namespace.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("value").map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE namespace = ? AND key = ?")
            .bind(self.namespace.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM records WHERE namespace = ? ORDER BY key ASC")
            .bind(self.namespace.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(db_err))
            .collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE namespace = ?")
            .bind(self.namespace.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = SqliteStore::in_memory("ns").await.unwrap();

        store.set("events_2", "two").await.unwrap();
        store.set("events_1", "one").await.unwrap();
        store.set("events_1", "uno").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["events_1", "events_2"]);
        assert_eq!(store.get("events_1").await.unwrap().as_deref(), Some("uno"));
        assert_eq!(store.get("events_3").await.unwrap(), None);

        store.remove("events_1").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["events_2"]);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_and_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("effm.db");
        {
            let a = SqliteStore::open(&path, "origin_a").await.unwrap();
            let b = SqliteStore::open(&path, "origin_b").await.unwrap();
            a.set("events_1", "a1").await.unwrap();
            b.set("events_1", "b1").await.unwrap();
            b.clear().await.unwrap();
        }
        let a = SqliteStore::open(&path, "origin_a").await.unwrap();
        assert_eq!(a.get("events_1").await.unwrap().as_deref(), Some("a1"));
        let b = SqliteStore::open(&path, "origin_b").await.unwrap();
        assert!(b.keys().await.unwrap().is_empty());
    }
}
