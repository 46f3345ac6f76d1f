//! Domain types shared by the relay reliability controllers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Logical channel identifier shared by two peers for a pairing/session.
pub type Topic = String;

/// Deterministic content hash of an outbound message (hex SHA-256).
pub type Fingerprint = String;

/// Default time-to-live for published messages.
pub const DEFAULT_PUBLISH_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default relay protocol selector.
pub const DEFAULT_RELAY_PROTOCOL: &str = "irn";

/// Compute the dedup fingerprint of an outbound message.
#[must_use]
pub fn fingerprint(message: &str) -> Fingerprint {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Relay protocol selector, resolved together with a logical operation name
/// into a concrete JSON-RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocol(pub String);

impl RelayProtocol {
    /// JSON-RPC method used to submit an outbound message.
    #[must_use]
    pub fn publish_method(&self) -> String {
        format!("{}_publish", self.0)
    }
}

impl Default for RelayProtocol {
    fn default() -> Self {
        Self(DEFAULT_RELAY_PROTOCOL.to_string())
    }
}

/// Delivery options for a published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Time-to-live of the message on the relay.
    pub ttl: Duration,
    /// Relay protocol selector.
    pub relay: RelayProtocol,
    /// Whether the relay should prompt the receiving peer.
    pub prompt: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PUBLISH_TTL,
            relay: RelayProtocol::default(),
            prompt: false,
        }
    }
}

/// Wire parameters of a relay publish call.
///
/// `prompt` is omitted entirely when unset, never sent as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPublishParams {
    pub topic: Topic,
    pub message: String,
    /// Time-to-live in seconds.
    pub ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<bool>,
}

/// An outbound message awaiting delivery acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPublish {
    pub topic: Topic,
    pub message: String,
    pub opts: PublishOptions,
}

/// A JSON-RPC request as issued by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Numeric correlation id, assumed caller-unique per session.
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC response, carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

/// The stored half of a resolved round trip: exactly one of result or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordResponse {
    Error { error: JsonRpcErrorData },
    Result { result: Value },
}

impl From<JsonRpcResponse> for RecordResponse {
    /// Classify a response as error-shaped or result-shaped.
    fn from(response: JsonRpcResponse) -> Self {
        match response.error {
            Some(error) => Self::Error { error },
            None => Self::Result {
                result: response.result.unwrap_or(Value::Null),
            },
        }
    }
}

/// The request half of a history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub params: Value,
}

/// One JSON-RPC request/response round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: Topic,
    pub request: RequestPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordResponse>,
}

impl JsonRpcRecord {
    /// A record is pending iff it has no response yet.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.response.is_none()
    }
}

/// Replay-ready outgoing request envelope for an unanswered record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub topic: Topic,
    pub request: JsonRpcRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// A TTL-bound resource keyed by topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    /// Absolute expiry as unix seconds.
    pub expiry: u64,
}

impl Expiration {
    /// Whether the expiry has passed at `now`.
    #[must_use]
    pub const fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }
}

/// Namespacing for durable storage keys.
///
/// Keys are flat versioned strings, stable across restarts, so an
/// incompatible on-disk layout is detected rather than misread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub prefix: String,
    pub version: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: "relaykit@".to_string(),
            version: "0.1".to_string(),
        }
    }
}

impl StorageConfig {
    /// Storage key for a named component: `<prefix><version>//<component>`.
    #[must_use]
    pub fn key(&self, component: &str) -> String {
        format!("{}{}//{component}", self.prefix, self.version)
    }
}
