//! Key-value persistence backend for the Daybook plugin runtime.
//!
//! The runtime treats persistence as an external collaborator: all it needs
//! is an async key-value store for plugin-scoped settings. This crate ships
//! the in-memory backend used by the host and by tests; a durable backend
//! implements the same surface.
//!
//! Keys are flat strings; the host namespaces them per plugin
//! (`plugin/<id>/<key>`), so prefix operations double as per-plugin bulk
//! removal.

mod error;

pub use error::{StorageError, StorageResult};

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// An in-memory key-value store with the async surface of a durable backend.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl KvStore {
    /// Opens an empty in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::default())
    }

    /// Reads a value.
    pub async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    /// Writes a value, overwriting any previous one.
    pub async fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Removes a key. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.entries.write().await.remove(key).is_some())
    }

    /// Lists all keys under a prefix, unordered.
    pub async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Removes every key under a prefix. Returns the number removed.
    pub async fn clear_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(prefix = %prefix, removed = removed, "Cleared storage prefix");
        }
        Ok(removed)
    }

    /// Total number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove_roundtrip() {
        tokio_test::block_on(async {
            let store = KvStore::open_in_memory().unwrap();
            assert_eq!(store.get("a").await.unwrap(), None);

            store.put("a", "1").await.unwrap();
            assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

            assert!(store.remove("a").await.unwrap());
            assert!(!store.remove("a").await.unwrap());
            assert_eq!(store.get("a").await.unwrap(), None);
        });
    }

    #[test]
    fn empty_key_rejected() {
        tokio_test::block_on(async {
            let store = KvStore::open_in_memory().unwrap();
            assert!(matches!(
                store.put("", "x").await,
                Err(StorageError::InvalidKey(_))
            ));
        });
    }

    #[test]
    fn prefix_operations_scope_correctly() {
        tokio_test::block_on(async {
            let store = KvStore::open_in_memory().unwrap();
            store.put("plugin/a/theme", "dark").await.unwrap();
            store.put("plugin/a/locale", "en").await.unwrap();
            store.put("plugin/b/theme", "light").await.unwrap();

            let mut keys = store.keys_with_prefix("plugin/a/").await.unwrap();
            keys.sort();
            assert_eq!(keys, vec!["plugin/a/locale", "plugin/a/theme"]);

            assert_eq!(store.clear_prefix("plugin/a/").await.unwrap(), 2);
            assert_eq!(store.len().await, 1);
            assert_eq!(
                store.get("plugin/b/theme").await.unwrap().as_deref(),
                Some("light")
            );
        });
    }
}
