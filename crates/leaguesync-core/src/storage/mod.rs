//! Durable key-value storage for serialized blobs.
//!
//! The engine persists its whole state under a handful of fixed, namespaced keys:
//! the sync queue, the cache entry map, and the last successful sync time.
//! Backends only need to store strings; (de)serialization happens in `load_json`
//! and `save_json`.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Key holding the serialized sync queue (array of operations).
pub const QUEUE_KEY: &str = "leaguesync:sync_queue";

/// Key holding the serialized cache (map of cache key to entry).
pub const CACHE_KEY: &str = "leaguesync:cache";

/// Key holding the timestamp of the last completed sync.
pub const LAST_SYNC_KEY: &str = "leaguesync:last_sync";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Read and deserialize a value. A missing key is `Ok(None)`.
pub async fn load_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key).await? {
        Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let contents = serde_json::to_string(value)?;
    storage.set(key, &contents).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_json_helpers_round_trip() {
        let storage = MemoryStorage::new();
        let mut value = HashMap::new();
        value.insert("a".to_string(), 1u32);

        save_json(&storage, "k", &value).await.unwrap();
        let loaded: Option<HashMap<String, u32>> = load_json(&storage, "k").await.unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn test_load_json_missing_key() {
        let storage = MemoryStorage::new();
        let loaded: Option<Vec<u32>> = load_json(&storage, "missing").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_json_corrupt_blob() {
        let storage = MemoryStorage::new();
        storage.set("k", "{not json").await.unwrap();
        let loaded: Result<Option<Vec<u32>>, _> = load_json(&storage, "k").await;
        assert!(matches!(loaded, Err(StorageError::Serialization(_))));
    }
}
