//! Mailbox handle and message types for actor instances.
//!
//! Every instance is a single tokio task that owns its state and processes
//! one message at a time. Callers talk to it through an [`ActorHandle`].

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_id::{ActorId, ConnId};
use ember_protocol::WirePayload;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::connection::{ConnSink, ConnStatus};
use super::context::LifecycleState;
use super::definition::{RawRequest, RawResponse};
use super::dispatch::{ConnectRequest, ConnectedConn};
use super::errors::ActorError;
use super::schedule::ScheduledEvent;
use crate::driver::ActorKey;

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: ActorId,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id,
        }
    }
}

impl<M: Message> ActorHandle<M> {
    pub(crate) fn new(actor_id: ActorId, tx: mpsc::Sender<M>) -> Self {
        Self { tx, actor_id }
    }

    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Instance messages
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T, ActorError>>;

pub enum InstanceMessage {
    Connect {
        request: ConnectRequest,
        reply: Reply<ConnectedConn>,
    },
    Reconnect {
        conn_id: ConnId,
        token: String,
        sink: Arc<dyn ConnSink>,
        reply: Reply<ConnectedConn>,
    },
    Frame {
        conn_id: ConnId,
        payload: WirePayload,
    },
    /// The transport went away; the client may reconnect.
    ConnDropped { conn_id: ConnId },
    /// The client closed cleanly.
    ConnClosed {
        conn_id: ConnId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Action {
        name: String,
        args: Vec<Value>,
        reply: Reply<Value>,
    },
    Request {
        request: RawRequest,
        reply: Reply<RawResponse>,
    },
    RawStreamOpened { stream_id: u64 },
    RawStreamClosed { stream_id: u64 },
    Alarm,
    Inspect { reply: Reply<InstanceSnapshot> },
    Stop { reply: oneshot::Sender<()> },
}

impl InstanceMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InstanceMessage::Connect { .. } => "connect",
            InstanceMessage::Reconnect { .. } => "reconnect",
            InstanceMessage::Frame { .. } => "frame",
            InstanceMessage::ConnDropped { .. } => "conn_dropped",
            InstanceMessage::ConnClosed { .. } => "conn_closed",
            InstanceMessage::Action { .. } => "action",
            InstanceMessage::Request { .. } => "request",
            InstanceMessage::RawStreamOpened { .. } => "raw_stream_opened",
            InstanceMessage::RawStreamClosed { .. } => "raw_stream_closed",
            InstanceMessage::Alarm => "alarm",
            InstanceMessage::Inspect { .. } => "inspect",
            InstanceMessage::Stop { .. } => "stop",
        }
    }

    /// Answers a message that will never be processed.
    pub(crate) fn reject(self, err: ActorError) {
        match self {
            InstanceMessage::Connect { reply, .. } | InstanceMessage::Reconnect { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            InstanceMessage::Action { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            InstanceMessage::Request { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            InstanceMessage::Inspect { reply } => {
                let _ = reply.send(Err(err));
            }
            InstanceMessage::ConnClosed { reply: Some(reply), .. } => {
                let _ = reply.send(false);
            }
            InstanceMessage::Stop { reply } => {
                let _ = reply.send(());
            }
            other => debug!(kind = other.kind(), error = %err, "Dropping message for stopped actor"),
        }
    }
}

impl Debug for InstanceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceMessage::Frame { conn_id, payload } => f
                .debug_struct("Frame")
                .field("conn_id", conn_id)
                .field("len", &payload.len())
                .finish(),
            InstanceMessage::Action { name, .. } => {
                f.debug_struct("Action").field("name", name).finish_non_exhaustive()
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// Point-in-time view of a running instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub actor_id: ActorId,
    pub name: String,
    pub key: ActorKey,
    pub lifecycle: LifecycleState,
    pub state: Value,
    pub connections: Vec<ConnSnapshot>,
    pub scheduled: Vec<ScheduledEvent>,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnSnapshot {
    pub id: ConnId,
    pub status: ConnStatus,
    pub params: Value,
    pub state: Option<Value>,
    pub subscriptions: Vec<String>,
    pub last_seen: u64,
}

pub type InstanceHandle = ActorHandle<InstanceMessage>;

impl ActorHandle<InstanceMessage> {
    async fn ask<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> InstanceMessage,
    ) -> Result<T, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| ActorError::ActorStopped)?
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectedConn, ActorError> {
        self.ask(|reply| InstanceMessage::Connect { request, reply }).await
    }

    pub async fn reconnect(
        &self,
        conn_id: ConnId,
        token: impl Into<String>,
        sink: Arc<dyn ConnSink>,
    ) -> Result<ConnectedConn, ActorError> {
        let token = token.into();
        self.ask(|reply| InstanceMessage::Reconnect {
            conn_id,
            token,
            sink,
            reply,
        })
        .await
    }

    pub async fn send_frame(&self, conn_id: ConnId, payload: WirePayload) -> Result<(), ActorError> {
        self.send(InstanceMessage::Frame { conn_id, payload }).await
    }

    pub async fn conn_dropped(&self, conn_id: ConnId) -> Result<(), ActorError> {
        self.send(InstanceMessage::ConnDropped { conn_id }).await
    }

    /// Removes the connection; resolves once the removal is persisted.
    pub async fn close_conn(&self, conn_id: ConnId) -> Result<bool, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(InstanceMessage::ConnClosed {
            conn_id,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    pub async fn call_action(&self, name: impl Into<String>, args: Vec<Value>) -> Result<Value, ActorError> {
        let name = name.into();
        self.ask(|reply| InstanceMessage::Action { name, args, reply })
            .await
    }

    pub async fn request(&self, request: RawRequest) -> Result<RawResponse, ActorError> {
        self.ask(|reply| InstanceMessage::Request { request, reply })
            .await
    }

    /// Marks a long-lived raw stream as open until the guard is dropped.
    /// The actor will not sleep while any guard is alive.
    pub async fn open_raw_stream(&self) -> Result<RawStreamGuard, ActorError> {
        let stream_id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        self.send(InstanceMessage::RawStreamOpened { stream_id }).await?;
        Ok(RawStreamGuard {
            handle: self.clone(),
            stream_id,
        })
    }

    pub async fn alarm(&self) -> Result<(), ActorError> {
        self.send(InstanceMessage::Alarm).await
    }

    pub async fn inspect(&self) -> Result<InstanceSnapshot, ActorError> {
        self.ask(|reply| InstanceMessage::Inspect { reply }).await
    }

    /// Stops the instance and waits for the stop sequence to finish.
    pub async fn stop(&self) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(InstanceMessage::Stop { reply }).await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Keeps an actor awake while a raw stream is open.
pub struct RawStreamGuard {
    handle: InstanceHandle,
    stream_id: u64,
}

impl RawStreamGuard {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl Drop for RawStreamGuard {
    fn drop(&mut self) {
        let msg = InstanceMessage::RawStreamClosed {
            stream_id: self.stream_id,
        };
        if let Err(ActorError::MailboxFull) = self.handle.try_send(msg) {
            let handle = self.handle.clone();
            let stream_id = self.stream_id;
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = handle
                        .send(InstanceMessage::RawStreamClosed { stream_id })
                        .await;
                });
            }
        }
    }
}
