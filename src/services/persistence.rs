use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

/// Durable key → string snapshot storage for queue state.
///
/// The queue persists a full JSON snapshot after every mutation; a missing
/// or unreadable value must surface as `None`, never as a hard failure, so
/// that startup degrades to an empty queue.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// File-backed store: one JSON file per key under a base directory.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            // Unreadable state is treated the same as missing state.
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read snapshot, treating as empty");
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral queues.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value before the queue initializes (crash-recovery tests).
    pub fn seed(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.load("queue").await.unwrap().is_none());

        store.save("queue", r#"{"items":[]}"#).await.unwrap();
        let loaded = store.load("queue").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(r#"{"items":[]}"#));
    }

    #[tokio::test]
    async fn test_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.save("queue", "first").await.unwrap();
        store.save("queue", "second").await.unwrap();
        assert_eq!(store.load("queue").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_memory_store_seed() {
        let store = MemoryStore::new();
        store.seed("queue", "seeded");
        assert_eq!(store.load("queue").await.unwrap().as_deref(), Some("seeded"));
    }
}
