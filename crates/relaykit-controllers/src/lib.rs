//! Reliability controllers for a pub/sub relay client.
//!
//! Three cooperating components share one structural pattern (exclusive
//! in-memory index, init gate, restore-once, persist-on-mutation, typed
//! event channel):
//! - `Publisher` - outbound delivery queue with heartbeat-driven retry
//! - `JsonRpcHistory` - request/response correlation ledger with replay
//! - `Expirer` - TTL index with eager and periodic expiry sweeps

pub mod expirer;
pub mod history;
pub mod publisher;

pub use expirer::{Expirer, ExpirerEvent};
pub use history::{HistoryEvent, JsonRpcHistory};
pub use publisher::{Publisher, PublisherEvent};

use relaykit_core::{StorageError, TransportError};
use thiserror::Error;

/// Controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Guarded invariant: public operations await readiness, so this is
    /// normally unreachable.
    #[error("Controller not initialized: {0}")]
    NotInitialized(&'static str),
    #[error("No matching id: {0}")]
    NoMatchingId(String),
    #[error("Mismatched topic {topic:?} for id {id}")]
    MismatchedTopic { id: u64, topic: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
