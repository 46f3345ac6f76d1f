//! JSON-RPC request/response correlation ledger with persistence and replay.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use futures::stream::BoxStream;
use relaykit_core::{
    InitGate, KeyValueStorage,
    types::{
        JsonRpcRecord, JsonRpcRequest, JsonRpcResponse, PendingRequest, RecordResponse,
        RequestPayload, StorageConfig, Topic,
    },
};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, trace};

use crate::ControllerError;

/// Storage namespace component name.
const STORE_NAME: &str = "history";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// History events.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    /// Restore finished and the gate is open.
    Init,
    /// A record was created for a new request.
    Created(JsonRpcRecord),
    /// A record received its response.
    Updated(JsonRpcRecord),
    /// A record was removed by an explicit delete.
    Deleted(JsonRpcRecord),
    /// The ledger snapshot was written to durable storage.
    Sync,
}

/// Ledger of JSON-RPC round trips keyed by correlation id.
///
/// Correlation ids are assumed caller-unique per session; the index is keyed
/// by id alone and topic validity is only enforced on the read path. Two
/// topics legitimately reusing one id would surface as a mismatched-topic
/// error on the second topic's read.
pub struct JsonRpcHistory<S: KeyValueStorage> {
    storage: Arc<S>,
    storage_key: String,
    records: RwLock<HashMap<u64, JsonRpcRecord>>,
    gate: InitGate,
    events: broadcast::Sender<HistoryEvent>,
}

impl<S: KeyValueStorage> JsonRpcHistory<S> {
    /// Create an uninitialized history; call [`Self::init`] before use.
    #[must_use]
    pub fn new(storage: Arc<S>, config: &StorageConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            storage_key: config.key(STORE_NAME),
            records: RwLock::new(HashMap::new()),
            gate: InitGate::new(),
            events,
        }
    }

    /// Restore persisted records and open the gate.
    ///
    /// A restore failure or a restore conflict (persisted backlog found
    /// while the live index is already non-empty) is logged and contained;
    /// the ledger becomes ready with whatever is already in memory.
    pub async fn init(&self) {
        if !self.gate.begin_restore() {
            return;
        }
        if let Some(staged) = self.restore().await {
            let mut records = self.records.write().await;
            if !staged.is_empty() && !records.is_empty() {
                error!(
                    key = %self.storage_key,
                    "restore conflict: live ledger not empty, persisted records ignored"
                );
            } else {
                for record in staged {
                    records.insert(record.id, record);
                }
            }
        }
        self.gate.mark_ready();
        let _ = self.events.send(HistoryEvent::Init);
        debug!(key = %self.storage_key, "history ready");
    }

    /// Store a new request record. No-op if the id already exists
    /// (idempotent, first write wins).
    ///
    /// # Errors
    /// Returns a storage error if the ledger snapshot could not be persisted.
    pub async fn set(
        &self,
        topic: Topic,
        request: JsonRpcRequest,
        chain_id: Option<String>,
    ) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        let record = {
            let mut records = self.records.write().await;
            if records.contains_key(&request.id) {
                trace!(id = request.id, "record exists, first write wins");
                return Ok(());
            }
            let record = JsonRpcRecord {
                id: request.id,
                topic,
                request: RequestPayload {
                    method: request.method,
                    params: request.params,
                },
                chain_id,
                response: None,
            };
            records.insert(record.id, record.clone());
            record
        };

        debug!(id = record.id, topic = %record.topic, "created history record");
        let _ = self.events.send(HistoryEvent::Created(record));
        self.persist().await
    }

    /// Attach a response to its record. No-op if the id is unknown or the
    /// record is already resolved (write-once).
    ///
    /// # Errors
    /// Returns a storage error if the ledger snapshot could not be persisted.
    pub async fn resolve(&self, response: JsonRpcResponse) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        let updated = {
            let mut records = self.records.write().await;
            match records.get_mut(&response.id) {
                Some(record) if record.is_pending() => {
                    record.response = Some(RecordResponse::from(response));
                    Some(record.clone())
                }
                Some(_) => {
                    trace!(id = response.id, "record already resolved, response is write-once");
                    None
                }
                None => {
                    trace!(id = response.id, "response for unknown id ignored");
                    None
                }
            }
        };

        let Some(record) = updated else {
            return Ok(());
        };
        debug!(id = record.id, topic = %record.topic, "resolved history record");
        let _ = self.events.send(HistoryEvent::Updated(record));
        self.persist().await
    }

    /// Fetch a record, enforcing that the id belongs to `topic`.
    ///
    /// # Errors
    /// `NoMatchingId` when the id is unknown; `MismatchedTopic` when the
    /// stored record was created under a different topic.
    pub async fn get(&self, topic: &str, id: u64) -> Result<JsonRpcRecord, ControllerError> {
        self.gate.wait_ready().await;

        let records = self.records.read().await;
        let record = records
            .get(&id)
            .ok_or_else(|| ControllerError::NoMatchingId(format!("history id {id}")))?;
        if record.topic != topic {
            return Err(ControllerError::MismatchedTopic {
                id,
                topic: topic.to_string(),
            });
        }
        Ok(record.clone())
    }

    /// Whether a record exists for `id` under `topic`.
    pub async fn exists(&self, topic: &str, id: u64) -> bool {
        self.gate.wait_ready().await;
        self.records
            .read()
            .await
            .get(&id)
            .is_some_and(|record| record.topic == topic)
    }

    /// Remove every record of `topic`, restricted to a single id when given.
    /// Silent no-op when nothing matches.
    ///
    /// # Errors
    /// Returns a storage error if the ledger snapshot could not be persisted.
    pub async fn delete(&self, topic: &str, id: Option<u64>) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        let removed: Vec<JsonRpcRecord> = {
            let mut records = self.records.write().await;
            let ids: Vec<u64> = records
                .values()
                .filter(|record| {
                    record.topic == topic && id.is_none_or(|wanted| record.id == wanted)
                })
                .map(|record| record.id)
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        for record in removed {
            debug!(id = record.id, topic = %record.topic, "deleted history record");
            let _ = self.events.send(HistoryEvent::Deleted(record));
            self.persist().await?;
        }
        Ok(())
    }

    /// Replay envelopes for every unanswered record, recomputed on demand.
    pub async fn pending(&self) -> Vec<PendingRequest> {
        self.gate.wait_ready().await;
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.is_pending())
            .map(|record| PendingRequest {
                topic: record.topic.clone(),
                request: JsonRpcRequest {
                    id: record.id,
                    method: record.request.method.clone(),
                    params: record.request.params.clone(),
                },
                chain_id: record.chain_id.clone(),
            })
            .collect()
    }

    /// Number of records in the ledger.
    pub async fn len(&self) -> usize {
        self.gate.wait_ready().await;
        self.records.read().await.len()
    }

    /// Whether the ledger holds no records.
    pub async fn is_empty(&self) -> bool {
        self.gate.wait_ready().await;
        self.records.read().await.is_empty()
    }

    /// Get a receiver for history events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// Stream of live history events (lagged events are dropped).
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, HistoryEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    /// Mirror all current records to durable storage.
    async fn persist(&self) -> Result<(), ControllerError> {
        if !self.gate.is_ready() {
            return Err(ControllerError::NotInitialized(STORE_NAME));
        }
        let records: Vec<JsonRpcRecord> = self.records.read().await.values().cloned().collect();
        self.storage
            .set_item(&self.storage_key, serde_json::to_value(&records)?)
            .await?;
        let _ = self.events.send(HistoryEvent::Sync);
        Ok(())
    }

    /// Read persisted records into a staging list.
    async fn restore(&self) -> Option<Vec<JsonRpcRecord>> {
        match self.storage.get_item(&self.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(records) => Some(records),
                Err(e) => {
                    error!(key = %self.storage_key, "persisted ledger unreadable: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(key = %self.storage_key, "ledger restore failed: {e}");
                None
            }
        }
    }
}
