//! Client connections and the per-actor connection table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ember_id::{ConnId, ConnToken};
use ember_protocol::{
    serialize_with_encoding, Encoding, EventFrame, PersistedConn, ToClient, WirePayload,
};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::errors::ActorError;

// =============================================================================
// Transport sink
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("connection transport closed")]
pub struct SinkClosed;

/// Outbound half of a client transport.
///
/// The instance only ever writes complete frames. Closing is asynchronous so
/// transports can flush before they report back.
pub trait ConnSink: Send + Sync + 'static {
    fn send(&self, payload: WirePayload) -> Result<(), SinkClosed>;

    fn disconnect(&self, reason: Option<String>) -> BoxFuture<'static, ()>;
}

/// What a [`ChannelSink`] delivers to its transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Frame(WirePayload),
    Close(Option<String>),
}

/// A sink that forwards frames over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnSink for ChannelSink {
    fn send(&self, payload: WirePayload) -> Result<(), SinkClosed> {
        self.tx.send(SinkEvent::Frame(payload)).map_err(|_| SinkClosed)
    }

    fn disconnect(&self, reason: Option<String>) -> BoxFuture<'static, ()> {
        let _ = self.tx.send(SinkEvent::Close(reason));
        Box::pin(async {})
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Connecting,
    Connected,
    /// The transport dropped; the client may come back with its token.
    Reconnecting,
    Disconnected,
}

/// A client attached to an actor.
pub struct Conn {
    pub(crate) id: ConnId,
    pub(crate) token: ConnToken,
    pub(crate) driver: String,
    pub(crate) encoding: Encoding,
    pub(crate) params: Value,
    pub(crate) state: Option<Value>,
    pub(crate) auth: Option<Value>,
    pub(crate) subscriptions: BTreeSet<String>,
    pub(crate) last_seen: u64,
    pub(crate) status: ConnStatus,
    pub(crate) sink: Option<Arc<dyn ConnSink>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("encoding", &self.encoding)
            .field("status", &self.status)
            .field("subscriptions", &self.subscriptions)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn auth(&self) -> Option<&Value> {
        self.auth.as_ref()
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.contains(event)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Serializes `msg` in this connection's encoding and sends it.
    pub(crate) fn send(&self, msg: &ToClient) -> bool {
        match serialize_with_encoding(self.encoding, msg) {
            Ok(payload) => self.send_payload(payload),
            Err(e) => {
                error!(conn_id = %self.id, error = %e, "Failed to serialize outgoing message");
                false
            }
        }
    }

    pub(crate) fn send_payload(&self, payload: WirePayload) -> bool {
        let Some(sink) = &self.sink else {
            debug!(conn_id = %self.id, status = ?self.status, "Dropping message for detached connection");
            return false;
        };
        match sink.send(payload) {
            Ok(()) => true,
            Err(SinkClosed) => {
                debug!(conn_id = %self.id, "Connection transport already closed");
                false
            }
        }
    }

    pub(crate) fn to_persisted(&self) -> PersistedConn {
        PersistedConn {
            id: self.id,
            token: self.token.clone(),
            driver: self.driver.clone(),
            driver_state: serde_json::json!({ "encoding": self.encoding.as_str() }),
            parameters: self.params.clone(),
            state: self.state.clone(),
            auth: self.auth.clone(),
            subscriptions: self.subscriptions.iter().cloned().collect(),
            last_seen: self.last_seen,
        }
    }

    /// Rebuilds a connection from its record. It starts detached, waiting
    /// for the client to reconnect.
    pub(crate) fn from_persisted(persisted: PersistedConn) -> Self {
        let encoding = persisted
            .driver_state
            .get("encoding")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();

        Self {
            id: persisted.id,
            token: persisted.token,
            driver: persisted.driver,
            encoding,
            params: persisted.parameters,
            state: persisted.state,
            auth: persisted.auth,
            subscriptions: persisted.subscriptions.into_iter().collect(),
            last_seen: persisted.last_seen,
            status: ConnStatus::Reconnecting,
            sink: None,
        }
    }
}

// =============================================================================
// Connection table
// =============================================================================

/// Connections of one actor, with a reverse index from event name to
/// subscribers.
#[derive(Default)]
pub(crate) struct ConnectionManager {
    conns: BTreeMap<ConnId, Conn>,
    subscribers: HashMap<String, BTreeSet<ConnId>>,
}

impl ConnectionManager {
    pub fn restore(persisted: Vec<PersistedConn>) -> Self {
        let mut manager = Self::default();
        for conn in persisted {
            let conn = Conn::from_persisted(conn);
            if let Err(e) = manager.insert(conn) {
                warn!(error = %e, "Skipping duplicate persisted connection");
            }
        }
        manager
    }

    pub fn insert(&mut self, conn: Conn) -> Result<(), ActorError> {
        if self.conns.contains_key(&conn.id) {
            return Err(ActorError::ConnExists(conn.id));
        }
        for event in &conn.subscriptions {
            self.subscribers
                .entry(event.clone())
                .or_default()
                .insert(conn.id);
        }
        self.conns.insert(conn.id, conn);
        Ok(())
    }

    pub fn remove(&mut self, id: &ConnId) -> Option<Conn> {
        let conn = self.conns.remove(id)?;
        for event in &conn.subscriptions {
            self.unindex(event, id);
        }
        Some(conn)
    }

    pub fn get(&self, id: &ConnId) -> Option<&Conn> {
        self.conns.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnId) -> Option<&mut Conn> {
        self.conns.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conn> {
        self.conns.values()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Returns `Ok(false)` if the connection was already subscribed.
    pub fn subscribe(&mut self, id: &ConnId, event: &str) -> Result<bool, ActorError> {
        let conn = self.conns.get_mut(id).ok_or(ActorError::ConnNotFound(*id))?;
        if !conn.subscriptions.insert(event.to_string()) {
            return Ok(false);
        }
        self.subscribers
            .entry(event.to_string())
            .or_default()
            .insert(*id);
        Ok(true)
    }

    /// Returns `Ok(false)` if the connection was not subscribed.
    pub fn unsubscribe(&mut self, id: &ConnId, event: &str) -> Result<bool, ActorError> {
        let conn = self.conns.get_mut(id).ok_or(ActorError::ConnNotFound(*id))?;
        if !conn.subscriptions.remove(event) {
            return Ok(false);
        }
        self.unindex(event, id);
        Ok(true)
    }

    pub fn subscribers(&self, event: &str) -> impl Iterator<Item = &Conn> {
        self.subscribers
            .get(event)
            .into_iter()
            .flatten()
            .filter_map(|id| self.conns.get(id))
    }

    pub fn has_connected(&self) -> bool {
        self.conns
            .values()
            .any(|c| c.status == ConnStatus::Connected)
    }

    /// Non-connected connections whose last activity is at least
    /// `timeout_ms` old.
    pub fn stale(&self, now_ms: u64, timeout_ms: u64) -> Vec<ConnId> {
        self.conns
            .values()
            .filter(|c| c.status != ConnStatus::Connected)
            .filter(|c| now_ms.saturating_sub(c.last_seen) >= timeout_ms)
            .map(|c| c.id)
            .collect()
    }

    /// Sends an event to every subscriber, serializing once per encoding.
    pub fn broadcast(&self, name: &str, args: Vec<Value>) -> usize {
        let msg = ToClient::Event(EventFrame {
            name: name.to_string(),
            args: Value::Array(args),
        });

        let mut encoded: HashMap<Encoding, Option<WirePayload>> = HashMap::new();
        let mut delivered = 0;
        for conn in self.subscribers(name) {
            let payload = encoded
                .entry(conn.encoding)
                .or_insert_with(|| match serialize_with_encoding(conn.encoding, &msg) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        error!(event = name, encoding = %conn.encoding, error = %e, "Failed to serialize broadcast");
                        None
                    }
                });
            if let Some(payload) = payload {
                if conn.send_payload(payload.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn to_persisted(&self) -> Vec<PersistedConn> {
        self.conns.values().map(Conn::to_persisted).collect()
    }

    fn unindex(&mut self, event: &str, id: &ConnId) {
        if let Some(ids) = self.subscribers.get_mut(event) {
            ids.remove(id);
            if ids.is_empty() {
                self.subscribers.remove(event);
            }
        }
    }
}
