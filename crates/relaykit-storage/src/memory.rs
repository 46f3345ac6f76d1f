//! In-memory key-value storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use relaykit_core::{KeyValueStorage, StorageError};
use serde_json::Value;

/// In-memory storage implementation.
///
/// Useful for development, tests and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    items: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .items
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .get(key)
            .cloned())
    }

    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.items
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .remove(key);
        Ok(())
    }
}
