//! Example wiring of the relay reliability controllers.
//!
//! Run with: cargo run -p relay-demo
//!
//! Uses in-memory storage, a loopback transport that acknowledges every
//! publish, and a fast heartbeat ticker so the sweeps are visible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use relaykit_controllers::{Expirer, JsonRpcHistory, Publisher};
use relaykit_core::{
    Heartbeat, RelayTransport, TransportError,
    types::{Expiration, JsonRpcRequest, JsonRpcResponse, PublishOptions, StorageConfig, unix_now},
};
use relaykit_storage::MemoryStorage;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transport that acknowledges every request.
struct LoopbackTransport;

#[async_trait]
impl RelayTransport for LoopbackTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        tracing::info!(%method, %params, "relay request");
        Ok(Value::Bool(true))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaykit_controllers=debug".into()),
        )
        .init();

    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(LoopbackTransport);
    let config = StorageConfig::default();

    let publisher = Arc::new(Publisher::new(transport, Arc::clone(&storage), &config));
    let history = Arc::new(JsonRpcHistory::new(Arc::clone(&storage), &config));
    let expirer = Arc::new(Expirer::new(Arc::clone(&storage), &config));

    publisher.init().await;
    history.init().await;
    expirer.init().await;

    // Fan the heartbeat out to both sweep consumers.
    let heartbeat = Arc::new(Heartbeat::new());
    let publisher_sweep = publisher.attach_heartbeat(heartbeat.subscribe());
    let expirer_sweep = expirer.attach_heartbeat(heartbeat.subscribe());
    let ticker = heartbeat.spawn_ticker(Duration::from_millis(500));

    // Print expirer events as they fire.
    let mut expirer_events = expirer.event_stream();
    let event_printer = tokio::spawn(async move {
        while let Some(event) = expirer_events.next().await {
            tracing::info!(?event, "expirer event");
        }
    });

    // One publish round trip.
    publisher
        .publish(
            "pairing-topic".to_string(),
            "hello peer".to_string(),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    // One request/response correlation.
    history
        .set(
            "pairing-topic".to_string(),
            JsonRpcRequest {
                id: 1,
                method: "session_propose".to_string(),
                params: json!({"chains": ["eip155:1"]}),
            },
            Some("eip155:1".to_string()),
        )
        .await
        .unwrap();
    tracing::info!(pending = history.pending().await.len(), "before resolve");
    history
        .resolve(JsonRpcResponse {
            id: 1,
            result: Some(json!({"approved": true})),
            error: None,
        })
        .await
        .unwrap();
    tracing::info!(pending = history.pending().await.len(), "after resolve");

    // A short-lived expiration, collected by the next sweep.
    expirer
        .set(
            "pairing-topic".to_string(),
            Expiration {
                expiry: unix_now() + 1,
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    tracing::info!(
        queued = publisher.queued_len().await,
        tracked = expirer.len().await,
        "shutting down"
    );

    ticker.abort();
    publisher_sweep.abort();
    expirer_sweep.abort();
    event_printer.abort();
}
