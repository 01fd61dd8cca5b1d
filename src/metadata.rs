//! Durable key-value persistence for sync bookkeeping.
//!
//! The engine remembers its cursor position, timestamps and collection
//! identity across restarts through a [`MetadataStore`]. Values are JSON;
//! putting `None` deletes a key.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::SyncError;

/// Keys the sync engine persists.
pub mod keys {
    pub const SYNC_POSITION: &str = "sync_position";
    pub const LAST_SYNC_TIME: &str = "last_sync_time";
    pub const LAST_SYNC_PUT: &str = "last_sync_put";
    pub const COLLECTION_ID: &str = "collection_id";
}

/// Simple durable key-value surface consulted at startup and updated
/// after every engine state change.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Reads the given keys; absent keys are omitted from the result.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, SyncError>;

    /// Writes one key. `None` removes it.
    async fn put(&self, key: &str, value: Option<Value>) -> Result<(), SyncError>;

    /// Writes several keys at once. `None` values remove their keys.
    async fn put_many(&self, values: HashMap<String, Option<Value>>) -> Result<(), SyncError>;

    /// Removes every key owned by this store.
    async fn clear(&self) -> Result<(), SyncError>;
}

/// In-memory metadata store, for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryMetadata {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, SyncError> {
        let values = self.values.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| values.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    async fn put(&self, key: &str, value: Option<Value>) -> Result<(), SyncError> {
        let mut values = self.values.lock().unwrap();
        match value {
            Some(value) => {
                values.insert(key.to_string(), value);
            }
            None => {
                values.remove(key);
            }
        }
        Ok(())
    }

    async fn put_many(&self, updates: HashMap<String, Option<Value>>) -> Result<(), SyncError> {
        let mut values = self.values.lock().unwrap();
        for (key, value) in updates {
            match value {
                Some(value) => {
                    values.insert(key, value);
                }
                None => {
                    values.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        self.values.lock().unwrap().clear();
        Ok(())
    }
}

/// File-backed metadata store: one JSON object per file, rewritten on
/// every change. The values are tiny, so durability beats cleverness.
pub struct FileMetadata {
    path: PathBuf,
    values: Mutex<HashMap<String, Value>>,
}

impl FileMetadata {
    /// Opens the store, loading any existing contents from `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let values = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            serde_json::from_str(&contents).map_err(|e| SyncError::Storage(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &HashMap<String, Value>) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::Storage(e.to_string()))?;
        }
        let contents =
            serde_json::to_string(values).map_err(|e| SyncError::Storage(e.to_string()))?;
        std::fs::write(&self.path, contents).map_err(|e| SyncError::Storage(e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for FileMetadata {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, SyncError> {
        let values = self.values.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| values.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    async fn put(&self, key: &str, value: Option<Value>) -> Result<(), SyncError> {
        let mut values = self.values.lock().unwrap();
        match value {
            Some(value) => {
                values.insert(key.to_string(), value);
            }
            None => {
                values.remove(key);
            }
        }
        self.flush(&values)
    }

    async fn put_many(&self, updates: HashMap<String, Option<Value>>) -> Result<(), SyncError> {
        let mut values = self.values.lock().unwrap();
        for (key, value) in updates {
            match value {
                Some(value) => {
                    values.insert(key, value);
                }
                None => {
                    values.remove(&key);
                }
            }
        }
        self.flush(&values)
    }

    async fn clear(&self) -> Result<(), SyncError> {
        let mut values = self.values.lock().unwrap();
        values.clear();
        self.flush(&values)
    }
}
