//! Outbound publish queue with unbounded heartbeat-driven retry.

use std::{collections::HashMap, sync::Arc};

use relaykit_core::{
    InitGate, KeyValueStorage, RelayTransport,
    types::{
        self, Fingerprint, PublishOptions, QueuedPublish, RelayPublishParams, StorageConfig, Topic,
    },
};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::ControllerError;

/// Storage namespace component name.
const STORE_NAME: &str = "publisher";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Publisher lifecycle events.
///
/// The publisher emits no domain events; delivery retries are visible only
/// through trace logging and the queue snapshot accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherEvent {
    /// Restore finished and the gate is open.
    Init,
    /// A queue snapshot was written to durable storage.
    Sync,
}

/// Outbound message queue keyed by content fingerprint.
///
/// An entry stays queued from submission until the transport acknowledges
/// it; every heartbeat pulse re-attempts every still-queued entry with no
/// backoff and no attempt limit. The effective retry interval is therefore
/// the heartbeat cadence chosen by the embedder.
pub struct Publisher<S, R>
where
    S: KeyValueStorage,
    R: RelayTransport,
{
    transport: Arc<R>,
    storage: Arc<S>,
    storage_key: String,
    queue: RwLock<HashMap<Fingerprint, QueuedPublish>>,
    gate: InitGate,
    events: broadcast::Sender<PublisherEvent>,
}

impl<S, R> Publisher<S, R>
where
    S: KeyValueStorage + 'static,
    R: RelayTransport + 'static,
{
    /// Create an uninitialized publisher; call [`Self::init`] before use.
    #[must_use]
    pub fn new(transport: Arc<R>, storage: Arc<S>, config: &StorageConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            storage,
            storage_key: config.key(STORE_NAME),
            queue: RwLock::new(HashMap::new()),
            gate: InitGate::new(),
            events,
        }
    }

    /// Restore the queue from durable storage and open the gate.
    ///
    /// Restore failures are logged and degrade to the current in-memory
    /// queue; they never abort startup. Calling `init` again is a no-op.
    pub async fn init(&self) {
        if !self.gate.begin_restore() {
            return;
        }
        if let Some(staged) = self.restore().await {
            let mut queue = self.queue.write().await;
            if !staged.is_empty() && !queue.is_empty() {
                error!(
                    key = %self.storage_key,
                    "restore conflict: live queue not empty, persisted backlog ignored"
                );
            } else {
                for entry in staged {
                    queue.insert(types::fingerprint(&entry.message), entry);
                }
            }
        }
        self.gate.mark_ready();
        let _ = self.events.send(PublisherEvent::Init);
        debug!(key = %self.storage_key, "publisher ready");
    }

    /// Queue and submit one outbound message.
    ///
    /// The entry is inserted into the queue before the transport call. On a
    /// failed attempt the entry deliberately stays queued for the next
    /// heartbeat sweep; the caller is told this single attempt failed, but
    /// the message is not lost.
    ///
    /// # Errors
    /// Returns the transport error of this attempt, or a storage error if
    /// the queue snapshot could not be persisted.
    pub async fn publish(
        &self,
        topic: Topic,
        message: String,
        opts: PublishOptions,
    ) -> Result<(), ControllerError> {
        self.gate.wait_ready().await;

        let fingerprint = types::fingerprint(&message);
        let entry = QueuedPublish {
            topic,
            message,
            opts,
        };
        self.queue
            .write()
            .await
            .insert(fingerprint.clone(), entry.clone());
        self.persist().await?;
        trace!(%fingerprint, topic = %entry.topic, "queued publish");

        self.submit(&fingerprint, &entry).await
    }

    /// Re-attempt every queued entry, one independent attempt per entry.
    ///
    /// Failed attempts are logged and left queued; each entry retries on
    /// every pulse until acknowledged or explicitly removed.
    pub async fn sweep(&self) {
        self.gate.wait_ready().await;

        let snapshot: Vec<(Fingerprint, QueuedPublish)> = self
            .queue
            .read()
            .await
            .iter()
            .map(|(fingerprint, entry)| (fingerprint.clone(), entry.clone()))
            .collect();

        for (fingerprint, entry) in snapshot {
            match self.submit(&fingerprint, &entry).await {
                Ok(()) => debug!(%fingerprint, topic = %entry.topic, "retry delivered"),
                Err(e) => warn!(%fingerprint, topic = %entry.topic, "retry failed: {e}"),
            }
        }
    }

    /// Spawn a task sweeping the queue on every heartbeat pulse.
    pub fn attach_heartbeat(
        self: &Arc<Self>,
        mut pulses: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(()) => publisher.sweep().await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "publisher heartbeat lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Whether a fingerprint is still awaiting acknowledgment.
    pub async fn is_queued(&self, fingerprint: &str) -> bool {
        self.queue.read().await.contains_key(fingerprint)
    }

    /// Number of entries awaiting acknowledgment.
    pub async fn queued_len(&self) -> usize {
        self.queue.read().await.len()
    }

    /// Get a receiver for lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PublisherEvent> {
        self.events.subscribe()
    }

    /// Single submission attempt; removes the entry on acknowledgment.
    async fn submit(
        &self,
        fingerprint: &str,
        entry: &QueuedPublish,
    ) -> Result<(), ControllerError> {
        let method = entry.opts.relay.publish_method();
        let params = RelayPublishParams {
            topic: entry.topic.clone(),
            message: entry.message.clone(),
            ttl: entry.opts.ttl.as_secs(),
            prompt: entry.opts.prompt.then_some(true),
        };
        self.transport
            .request(&method, serde_json::to_value(&params)?)
            .await?;

        self.queue.write().await.remove(fingerprint);
        self.persist().await?;
        trace!(%fingerprint, "publish acknowledged");
        Ok(())
    }

    /// Mirror the current queue to durable storage.
    async fn persist(&self) -> Result<(), ControllerError> {
        if !self.gate.is_ready() {
            return Err(ControllerError::NotInitialized(STORE_NAME));
        }
        let entries: Vec<QueuedPublish> = self.queue.read().await.values().cloned().collect();
        self.storage
            .set_item(&self.storage_key, serde_json::to_value(&entries)?)
            .await?;
        let _ = self.events.send(PublisherEvent::Sync);
        Ok(())
    }

    /// Read the persisted backlog into a staging list.
    async fn restore(&self) -> Option<Vec<QueuedPublish>> {
        match self.storage.get_item(&self.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    error!(key = %self.storage_key, "persisted queue unreadable: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(key = %self.storage_key, "queue restore failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use relaykit_core::TransportError;
    use relaykit_storage::MemoryStorage;
    use serde_json::Value;

    use super::*;

    /// Transport that fails the first `failures` requests, then succeeds.
    struct FlakyTransport {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyTransport {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RelayTransport for FlakyTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
            assert_eq!(method, "irn_publish");
            assert!(params.get("topic").is_some());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Connection("relay unreachable".to_string()));
            }
            Ok(Value::Bool(true))
        }
    }

    async fn publisher(
        transport: Arc<FlakyTransport>,
        storage: Arc<MemoryStorage>,
    ) -> Publisher<MemoryStorage, FlakyTransport> {
        let publisher = Publisher::new(transport, storage, &StorageConfig::default());
        publisher.init().await;
        publisher
    }

    #[tokio::test]
    async fn successful_publish_removes_entry() {
        let transport = FlakyTransport::failing(0);
        let publisher = publisher(Arc::clone(&transport), Arc::new(MemoryStorage::new())).await;

        publisher
            .publish("topic-a".to_string(), "msg".to_string(), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(publisher.queued_len().await, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_publish_raises_and_stays_queued() {
        let transport = FlakyTransport::failing(1);
        let publisher = publisher(transport, Arc::new(MemoryStorage::new())).await;

        let fingerprint = types::fingerprint("msg");
        let result = publisher
            .publish("topic-a".to_string(), "msg".to_string(), PublishOptions::default())
            .await;

        assert!(matches!(result, Err(ControllerError::Transport(_))));
        assert!(publisher.is_queued(&fingerprint).await, "failed entry must stay queued");
    }

    #[tokio::test]
    async fn retry_until_success_with_single_removal() {
        let transport = FlakyTransport::failing(3);
        let publisher = publisher(Arc::clone(&transport), Arc::new(MemoryStorage::new())).await;

        let fingerprint = types::fingerprint("msg");
        publisher
            .publish("topic-a".to_string(), "msg".to_string(), PublishOptions::default())
            .await
            .unwrap_err();

        // Two more failing pulses: the fingerprint stays queued throughout.
        for _ in 0..2 {
            publisher.sweep().await;
            assert!(publisher.is_queued(&fingerprint).await);
        }

        // Fourth attempt succeeds and removes the entry exactly once.
        publisher.sweep().await;
        assert!(!publisher.is_queued(&fingerprint).await);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);

        // A further sweep finds nothing to do.
        publisher.sweep().await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn heartbeat_pulse_drives_sweep() {
        let transport = FlakyTransport::failing(1);
        let publisher = Arc::new(
            publisher(Arc::clone(&transport), Arc::new(MemoryStorage::new())).await,
        );
        let heartbeat = relaykit_core::Heartbeat::new();
        let task = publisher.attach_heartbeat(heartbeat.subscribe());

        let fingerprint = types::fingerprint("msg");
        publisher
            .publish("topic-a".to_string(), "msg".to_string(), PublishOptions::default())
            .await
            .unwrap_err();

        heartbeat.pulse();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while publisher.is_queued(&fingerprint).await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pulse-driven retry delivers the message");

        task.abort();
    }

    #[tokio::test]
    async fn unacknowledged_queue_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let fingerprint = types::fingerprint("msg");

        let first = publisher(FlakyTransport::failing(usize::MAX), Arc::clone(&storage)).await;
        first
            .publish("topic-a".to_string(), "msg".to_string(), PublishOptions::default())
            .await
            .unwrap_err();
        drop(first);

        let second = publisher(FlakyTransport::failing(0), storage).await;
        assert!(second.is_queued(&fingerprint).await, "queue must be restored");

        second.sweep().await;
        assert_eq!(second.queued_len().await, 0);
    }

    #[tokio::test]
    async fn init_emits_init_event_once() {
        let publisher = Publisher::new(
            FlakyTransport::failing(0),
            Arc::new(MemoryStorage::new()),
            &StorageConfig::default(),
        );
        let mut events = publisher.subscribe();

        publisher.init().await;
        publisher.init().await; // no-op

        assert_eq!(events.recv().await.unwrap(), PublisherEvent::Init);
        assert!(events.try_recv().is_err(), "init must fire exactly once");
    }
}
