//! Core abstractions for the relay reliability layer.
//!
//! This crate provides the fundamental building blocks:
//! - Domain types (`Topic`, JSON-RPC shapes, publish options, expirations)
//! - `InitGate` - tri-state readiness gate with a one-shot signal
//! - `Heartbeat` - pulse fan-out driving periodic maintenance sweeps
//! - Storage and relay transport traits

pub mod gate;
pub mod heartbeat;
pub mod traits;
pub mod types;

pub use gate::InitGate;
pub use heartbeat::Heartbeat;
pub use traits::{KeyValueStorage, RelayTransport, StorageError, TransportError};
pub use types::{
    Expiration, Fingerprint, JsonRpcRecord, JsonRpcRequest, JsonRpcResponse, PublishOptions,
    StorageConfig, Topic,
};
