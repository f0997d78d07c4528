//! Shared harness for actor host integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ember_host::actors::{
    ActorManager, ActorManagerBuilder, ActorQuery, ChannelSink, ConnectRequest, SinkEvent,
};
use ember_host::clock::{Clock, SystemClock};
use ember_host::{ActorKey, MemoryDriver};
use ember_protocol::{
    decode_typed, persisted_actor_codec, ActionRequest, Encoding, SubscriptionRequest, ToClient,
    ToServer, WirePayload,
};
use ember_id::ActorId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub struct Harness {
    pub manager: ActorManager,
    pub driver: Arc<MemoryDriver>,
    /// Dropping the sender would read as a shutdown signal.
    pub shutdown_tx: watch::Sender<bool>,
}

/// Builds a manager over an in-memory driver on the paused tokio clock.
pub fn harness(register: impl FnOnce(ActorManagerBuilder) -> ActorManagerBuilder) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    harness_with(MemoryDriver::new(Arc::clone(&clock)), clock, register)
}

pub fn harness_with(
    driver: MemoryDriver,
    clock: Arc<dyn Clock>,
    register: impl FnOnce(ActorManagerBuilder) -> ActorManagerBuilder,
) -> Harness {
    let driver = Arc::new(driver);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = register(ActorManager::builder(Arc::clone(&driver)).clock(clock))
        .build(shutdown_rx)
        .unwrap();
    Harness {
        manager,
        driver,
        shutdown_tx,
    }
}

pub fn key_query(name: &str, key: &str) -> ActorQuery {
    ActorQuery::GetOrCreateForKey {
        name: name.to_string(),
        key: ActorKey::new([key]),
        input: None,
    }
}

pub fn json_client(params: Value) -> (ConnectRequest, mpsc::UnboundedReceiver<SinkEvent>) {
    let (sink, rx) = ChannelSink::new();
    let request = ConnectRequest {
        params,
        auth: None,
        encoding: Encoding::Json,
        driver: "test".to_string(),
        sink: Arc::new(sink),
    };
    (request, rx)
}

pub fn action_frame(id: u64, name: &str, args: Value) -> WirePayload {
    let msg = ToServer::ActionRequest(ActionRequest {
        id,
        name: name.to_string(),
        args,
    });
    WirePayload::Text(serde_json::to_string(&msg).unwrap())
}

pub fn subscribe_frame(event_name: &str) -> WirePayload {
    let msg = ToServer::SubscriptionRequest(SubscriptionRequest {
        event_name: event_name.to_string(),
        subscribe: true,
    });
    WirePayload::Text(serde_json::to_string(&msg).unwrap())
}

/// Next frame written to a JSON client.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> ToClient {
    match rx.recv().await {
        Some(SinkEvent::Frame(WirePayload::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Lets spawned work (queued writes, wake routing) run to completion.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn wait_inactive(manager: &ActorManager, actor_id: &ActorId) {
    for _ in 0..200 {
        if !manager.is_active(actor_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("actor {actor_id} never stopped");
}

/// Decodes the state in the actor's stored record.
pub fn stored_state<S: DeserializeOwned>(driver: &MemoryDriver, actor_id: &ActorId) -> S {
    let bytes = driver.record(actor_id).expect("actor has a record");
    let record = persisted_actor_codec()
        .deserialize_with_embedded_version(&bytes)
        .unwrap();
    decode_typed(&record.state.expect("record is initialized")).unwrap()
}
