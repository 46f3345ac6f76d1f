//! TTL-driven garbage collector for time-bound topics.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use futures::stream::BoxStream;
use relaykit_core::{
    InitGate, KeyValueStorage,
    types::{self, Expiration, StorageConfig, Topic},
};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, trace, warn};

use crate::ControllerError;

/// Storage namespace component name.
const STORE_NAME: &str = "expirer";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Expirer events.
///
/// `Expired` is a passive timeout notification; `Deleted` only fires for an
/// explicit caller-initiated removal. Downstream consumers rely on the
/// distinction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirerEvent {
    /// Restore finished and the gate is open.
    Init,
    /// An expiration was stored.
    Created { topic: Topic, expiration: Expiration },
    /// An expiration was removed by an explicit delete.
    Deleted { topic: Topic, expiration: Expiration },
    /// An expiration elapsed and its entry was removed.
    Expired { topic: Topic, expiration: Expiration },
    /// The index snapshot was written to durable storage.
    Sync,
}

/// Topic -> expiry index with eager and heartbeat-driven sweeps.
pub struct Expirer<S: KeyValueStorage> {
    storage: Arc<S>,
    storage_key: String,
    expirations: RwLock<HashMap<Topic, Expiration>>,
    gate: InitGate,
    events: broadcast::Sender<ExpirerEvent>,
}

impl<S: KeyValueStorage + 'static> Expirer<S> {
    /// Create an uninitialized expirer; call [`Self::init`] before use.
    #[must_use]
    pub fn new(storage: Arc<S>, config: &StorageConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            storage_key: config.key(STORE_NAME),
            expirations: RwLock::new(HashMap::new()),
            gate: InitGate::new(),
            events,
        }
    }

    /// Restore persisted expirations and open the gate.
    ///
    /// Restore failures and conflicts are logged and contained, never raised.
    pub async fn init(&self) {
        if !self.gate.begin_restore() {
            return;
        }
        if let Some(staged) = self.restore().await {
            let mut expirations = self.expirations.write().await;
            if !staged.is_empty() && !expirations.is_empty() {
                error!(
                    key = %self.storage_key,
                    "restore conflict: live index not empty, persisted expirations ignored"
                );
            } else {
                expirations.extend(staged);
            }
        }
        self.gate.mark_ready();
        let _ = self.events.send(ExpirerEvent::Init);
        debug!(key = %self.storage_key, "expirer ready");
    }

    /// Whether an expiration exists for `topic`. Never raises; a missing
    /// entry is an ordinary `false`.
    pub async fn has(&self, topic: &str) -> bool {
        self.gate.wait_ready().await;
        self.expirations.read().await.contains_key(topic)
    }

    /// Store an expiration, then immediately check it against the clock.
    ///
    /// An expiry already in the past (zero TTL, clock skew) runs the full
    /// expire-and-delete path synchronously within this call; the outcome is
    /// identical to a later heartbeat sweep. `Created` is emitted regardless.
    ///
    /// # Errors
    /// Returns a storage error if the index snapshot could not be persisted.
    pub async fn set(&self, topic: Topic, expiration: Expiration) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        self.expirations.write().await.insert(topic.clone(), expiration);
        debug!(%topic, expiry = expiration.expiry, "created expiration");
        let _ = self.events.send(ExpirerEvent::Created {
            topic: topic.clone(),
            expiration,
        });
        self.persist().await?;

        // Eager path for expiries that have already passed.
        self.check_expiry(&topic, expiration).await
    }

    /// Fetch the expiration of `topic`.
    ///
    /// # Errors
    /// `NoMatchingId` when no entry exists.
    pub async fn get(&self, topic: &str) -> Result<Expiration, ControllerError> {
        self.gate.wait_ready().await;
        self.expirations
            .read()
            .await
            .get(topic)
            .copied()
            .ok_or_else(|| ControllerError::NoMatchingId(format!("expiration topic {topic}")))
    }

    /// Remove the expiration of `topic`. Silent no-op when absent.
    ///
    /// # Errors
    /// Returns a storage error if the index snapshot could not be persisted.
    pub async fn del(&self, topic: &str) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        let Some(expiration) = self.expirations.write().await.remove(topic) else {
            return Ok(());
        };
        debug!(%topic, "deleted expiration");
        let _ = self.events.send(ExpirerEvent::Deleted {
            topic: topic.to_string(),
            expiration,
        });
        self.persist().await
    }

    /// Re-check every entry against the current time, expiring the elapsed
    /// ones. Each check-and-act is self-contained and idempotent per entry.
    pub async fn sweep(&self) {
        self.gate.wait_ready().await;

        let snapshot: Vec<(Topic, Expiration)> = self
            .expirations
            .read()
            .await
            .iter()
            .map(|(topic, expiration)| (topic.clone(), *expiration))
            .collect();

        for (topic, expiration) in snapshot {
            if let Err(e) = self.check_expiry(&topic, expiration).await {
                warn!(%topic, "expiry sweep failed: {e}");
            }
        }
    }

    /// Spawn a task sweeping the index on every heartbeat pulse.
    pub fn attach_heartbeat(
        self: &Arc<Self>,
        mut pulses: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let expirer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(()) => expirer.sweep().await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "expirer heartbeat lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of tracked expirations.
    pub async fn len(&self) -> usize {
        self.gate.wait_ready().await;
        self.expirations.read().await.len()
    }

    /// Whether no expirations are tracked.
    pub async fn is_empty(&self) -> bool {
        self.gate.wait_ready().await;
        self.expirations.read().await.is_empty()
    }

    /// Get a receiver for expirer events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    /// Stream of live expirer events (lagged events are dropped).
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, ExpirerEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    /// Expire-and-delete `topic` if its expiry has passed.
    async fn check_expiry(
        &self,
        topic: &str,
        expiration: Expiration,
    ) -> Result<(), ControllerError> {
        if !expiration.is_expired(types::unix_now()) {
            return Ok(());
        }
        // Already removed by a concurrent delete: nothing to announce.
        let Some(expiration) = self.expirations.write().await.remove(topic) else {
            return Ok(());
        };
        debug!(%topic, expiry = expiration.expiry, "expiration elapsed");
        let _ = self.events.send(ExpirerEvent::Expired {
            topic: topic.to_string(),
            expiration,
        });
        self.persist().await
    }

    /// Mirror all current expirations to durable storage.
    async fn persist(&self) -> Result<(), ControllerError> {
        if !self.gate.is_ready() {
            return Err(ControllerError::NotInitialized(STORE_NAME));
        }
        let entries: HashMap<Topic, Expiration> = self.expirations.read().await.clone();
        self.storage
            .set_item(&self.storage_key, serde_json::to_value(&entries)?)
            .await?;
        let _ = self.events.send(ExpirerEvent::Sync);
        Ok(())
    }

    /// Read persisted expirations into a staging list.
    async fn restore(&self) -> Option<HashMap<Topic, Expiration>> {
        match self.storage.get_item(&self.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    error!(key = %self.storage_key, "persisted expirations unreadable: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(key = %self.storage_key, "expirer restore failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use relaykit_storage::MemoryStorage;

    use super::*;

    async fn expirer() -> Expirer<MemoryStorage> {
        expirer_on(Arc::new(MemoryStorage::new())).await
    }

    async fn expirer_on(storage: Arc<MemoryStorage>) -> Expirer<MemoryStorage> {
        let expirer = Expirer::new(storage, &StorageConfig::default());
        expirer.init().await;
        expirer
    }

    fn future_expiration() -> Expiration {
        Expiration {
            expiry: types::unix_now() + 3600,
        }
    }

    fn past_expiration() -> Expiration {
        Expiration {
            expiry: types::unix_now().saturating_sub(10),
        }
    }

    #[tokio::test]
    async fn set_get_has_del_round_trip() {
        let expirer = expirer().await;
        let expiration = future_expiration();

        expirer.set("topic-a".to_string(), expiration).await.unwrap();
        assert!(expirer.has("topic-a").await);
        assert_eq!(expirer.get("topic-a").await.unwrap(), expiration);

        expirer.del("topic-a").await.unwrap();
        assert!(!expirer.has("topic-a").await);
        assert!(matches!(
            expirer.get("topic-a").await,
            Err(ControllerError::NoMatchingId(_))
        ));

        // Deleting again is a silent no-op.
        expirer.del("topic-a").await.unwrap();
    }

    #[tokio::test]
    async fn has_never_raises_for_missing_topic() {
        let expirer = expirer().await;
        assert!(!expirer.has("missing").await);
    }

    #[tokio::test]
    async fn set_in_the_past_expires_eagerly() {
        let expirer = expirer().await;
        let mut events = expirer.subscribe();
        let expiration = past_expiration();

        expirer.set("topic-a".to_string(), expiration).await.unwrap();
        assert!(!expirer.has("topic-a").await, "already-elapsed entry must not persist");

        assert_eq!(
            events.recv().await.unwrap(),
            ExpirerEvent::Created {
                topic: "topic-a".to_string(),
                expiration,
            },
            "created fires regardless of eager expiry"
        );
        assert_eq!(events.recv().await.unwrap(), ExpirerEvent::Sync);
        assert_eq!(
            events.recv().await.unwrap(),
            ExpirerEvent::Expired {
                topic: "topic-a".to_string(),
                expiration,
            }
        );
        assert_eq!(events.recv().await.unwrap(), ExpirerEvent::Sync);
    }

    #[tokio::test]
    async fn sweep_expires_elapsed_entries_only() {
        let expirer = expirer().await;
        let keep = future_expiration();
        expirer.set("topic-keep".to_string(), keep).await.unwrap();

        // Inserted directly to model an entry that elapsed between pulses.
        let gone = past_expiration();
        expirer
            .expirations
            .write()
            .await
            .insert("topic-gone".to_string(), gone);

        let mut events = expirer.subscribe();
        expirer.sweep().await;

        assert!(expirer.has("topic-keep").await);
        assert!(!expirer.has("topic-gone").await);
        assert_eq!(
            events.recv().await.unwrap(),
            ExpirerEvent::Expired {
                topic: "topic-gone".to_string(),
                expiration: gone,
            }
        );
    }

    #[tokio::test]
    async fn heartbeat_pulse_drives_sweep() {
        let expirer = Arc::new(expirer().await);
        let heartbeat = relaykit_core::Heartbeat::new();
        let task = expirer.attach_heartbeat(heartbeat.subscribe());

        expirer
            .expirations
            .write()
            .await
            .insert("topic-a".to_string(), past_expiration());

        heartbeat.pulse();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while expirer.has("topic-a").await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pulse-driven sweep expires the entry");

        task.abort();
    }

    #[tokio::test]
    async fn expired_and_deleted_events_are_distinct() {
        let expirer = expirer().await;
        let mut events = expirer.subscribe();

        expirer
            .set("topic-a".to_string(), future_expiration())
            .await
            .unwrap();
        expirer.del("topic-a").await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ExpirerEvent::Created { .. }));
        assert_eq!(events.recv().await.unwrap(), ExpirerEvent::Sync);
        assert!(
            matches!(events.recv().await.unwrap(), ExpirerEvent::Deleted { .. }),
            "explicit removal must not announce an expiry"
        );
    }

    #[tokio::test]
    async fn event_stream_yields_events_in_mutation_order() {
        let expirer = expirer().await;
        let mut stream = expirer.event_stream();
        let expiration = future_expiration();

        expirer.set("topic-a".to_string(), expiration).await.unwrap();
        expirer.del("topic-a").await.unwrap();

        assert_eq!(
            stream.next().await.unwrap(),
            ExpirerEvent::Created {
                topic: "topic-a".to_string(),
                expiration,
            }
        );
        assert_eq!(stream.next().await.unwrap(), ExpirerEvent::Sync);
        assert_eq!(
            stream.next().await.unwrap(),
            ExpirerEvent::Deleted {
                topic: "topic-a".to_string(),
                expiration,
            }
        );
        assert_eq!(stream.next().await.unwrap(), ExpirerEvent::Sync);
    }

    #[tokio::test]
    async fn persisted_index_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let expiration = future_expiration();

        let first = expirer_on(Arc::clone(&storage)).await;
        first.set("topic-a".to_string(), expiration).await.unwrap();
        drop(first);

        let second = expirer_on(storage).await;
        assert_eq!(second.get("topic-a").await.unwrap(), expiration);
    }

    #[tokio::test]
    async fn restore_conflict_leaves_live_index_unchanged() {
        let storage = Arc::new(MemoryStorage::new());
        let config = StorageConfig::default();
        let mut persisted = HashMap::new();
        persisted.insert("topic-a".to_string(), future_expiration());
        storage
            .set_item(&config.key("expirer"), serde_json::to_value(&persisted).unwrap())
            .await
            .unwrap();

        let expirer = Expirer::new(storage, &config);
        expirer
            .expirations
            .write()
            .await
            .insert("topic-live".to_string(), future_expiration());
        expirer.init().await;

        assert!(expirer.has("topic-live").await);
        assert!(!expirer.has("topic-a").await, "conflicting backlog must not merge");
    }
}
