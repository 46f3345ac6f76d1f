//! Trait seams for the durable store and the relay transport.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Durable store error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Relay transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Relay rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Relay connection error: {0}")]
    Connection(String),
}

/// Async key-value persistence, addressed by a versioned namespaced key.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    async fn get_item(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set_item(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove the value stored under `key`. No-op when absent.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Outbound relay submission.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Submit a single JSON-RPC request over the relay wire.
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}
