//! JSON file storage implementation.
//!
//! The simple key-value adapter: every key is one `<key>.json` file inside
//! `<base>/<namespace>/`. Writes go to a temporary file first and are renamed
//! into place, so a crash never leaves a half-written value behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::trait_::{check_key, Result, StorageAdapter};

const EXTENSION: &str = "json";

/// File-based key-value store.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) the store for `namespace` under `base`.
    pub async fn new(base: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        check_key(namespace)?;
        let root = base.as_ref().join(namespace);
        fs::create_dir_all(&root).await?;
        debug!("Opened JSON file store at {}", root.display());
        Ok(Self { root })
    }

    /// Directory holding this namespace's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, EXTENSION))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}.tmp", key, EXTENSION))
    }
}

#[async_trait]
impl StorageAdapter for JsonFileStore {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        let tmp = self.temp_path(key);
        fs::write(&tmp, value.as_bytes()).await?;
        fs::rename(&tmp, self.value_path(key)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        read_value(&self.value_path(key)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        check_key(key)?;
        fs::remove_file(self.value_path(key)).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
        })?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = list_keys(&self.root).await?;
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for key in list_keys(&self.root).await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}

async fn read_value(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_keys(dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            keys.push(stem.to_string());
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path(), "ns").await.unwrap();

        store.set("events_0000000000002", r#"{"b":2}"#).await.unwrap();
        store.set("events_0000000000001", r#"{"a":1}"#).await.unwrap();
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["events_0000000000001", "events_0000000000002"]
        );
        assert_eq!(
            store.get("events_0000000000001").await.unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(store.get("events_missing").await.unwrap(), None);

        store.remove("events_0000000000001").await.unwrap();
        store.remove("events_0000000000001").await.unwrap();
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = JsonFileStore::new(dir.path(), "origin_a").await.unwrap();
        let b = JsonFileStore::new(dir.path(), "origin_b").await.unwrap();

        a.set("events_1", "x").await.unwrap();
        b.set("events_2", "y").await.unwrap();
        a.clear().await.unwrap();

        assert!(a.keys().await.unwrap().is_empty());
        assert_eq!(b.keys().await.unwrap(), vec!["events_2"]);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::new(dir.path(), "ns").await.unwrap();
            store.set("events_1", "persisted").await.unwrap();
        }
        let store = JsonFileStore::new(dir.path(), "ns").await.unwrap();
        assert_eq!(store.get("events_1").await.unwrap().as_deref(), Some("persisted"));
    }
}
