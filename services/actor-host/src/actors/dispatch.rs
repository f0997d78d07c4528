//! Client protocol handling: connection setup, frames, and action calls.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ember_id::{ActorId, ConnId, ConnToken};
use ember_protocol::{
    deserialize_with_encoding, ActionResponse, Encoding, Init, ToClient, ToServer, WirePayload,
};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::connection::{Conn, ConnSink, ConnStatus};
use super::context::{ActorContext, ActorState};
use super::definition::{ConnStateInit, ConnectParams, RawRequest, RawResponse};
use super::errors::ActorError;

/// A new client asking to attach to an actor.
#[derive(Clone)]
pub struct ConnectRequest {
    pub params: Value,
    pub auth: Option<Value>,
    pub encoding: Encoding,
    /// Name of the transport, persisted with the connection.
    pub driver: String,
    pub sink: Arc<dyn ConnSink>,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("encoding", &self.encoding)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

/// Identity handed back to a transport once its client is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedConn {
    pub actor_id: ActorId,
    pub conn_id: ConnId,
    pub token: ConnToken,
}

/// Decodes a client frame, enforcing the size limit first.
pub(crate) fn parse_message(
    encoding: Encoding,
    payload: &WirePayload,
    max_size: usize,
) -> Result<ToServer, ActorError> {
    if payload.len() > max_size {
        return Err(ActorError::MessageTooLong {
            size: payload.len(),
            max: max_size,
        });
    }
    deserialize_with_encoding(encoding, payload).map_err(|e| ActorError::MalformedMessage(e.to_string()))
}

fn action_args(args: Value) -> Result<Vec<Value>, ActorError> {
    match args {
        Value::Array(args) => Ok(args),
        Value::Null => Ok(Vec::new()),
        _ => Err(ActorError::MalformedMessage(
            "action arguments must be an array".into(),
        )),
    }
}

impl<S: ActorState> ActorContext<S> {
    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    pub(crate) async fn connect(&mut self, request: ConnectRequest) -> Result<ConnectedConn, ActorError> {
        self.assert_ready()?;
        let definition = Arc::clone(&self.definition);
        let options = &definition.options;
        let presented = ConnectParams {
            params: request.params,
            auth: request.auth,
        };

        if let Some(hook) = &definition.on_before_connect {
            tokio::time::timeout(options.on_connect_timeout, hook(self, &presented))
                .await
                .map_err(|_| ActorError::Internal("on_before_connect timed out".into()))??;
        }

        let state = match &definition.conn_state {
            ConnStateInit::None => None,
            ConnStateInit::Static(initial) => Some(initial.clone()),
            ConnStateInit::Factory(create) => Some(
                tokio::time::timeout(options.create_conn_state_timeout, create(self, &presented))
                    .await
                    .map_err(|_| ActorError::Internal("creating connection state timed out".into()))??,
            ),
        };

        let conn = Conn {
            id: ConnId::new(),
            token: ConnToken::generate(),
            driver: request.driver,
            encoding: request.encoding,
            params: presented.params,
            state,
            auth: presented.auth,
            subscriptions: Default::default(),
            last_seen: self.now_ms(),
            status: ConnStatus::Connected,
            sink: Some(request.sink),
        };
        self.create_conn(conn).await
    }

    async fn create_conn(&mut self, conn: Conn) -> Result<ConnectedConn, ActorError> {
        let conn_id = conn.id;
        let token = conn.token.clone();
        self.conns.insert(conn)?;
        self.mark_dirty();

        if let Err(e) = self.save_immediate(false).await {
            self.conns.remove(&conn_id);
            return Err(e);
        }
        info!(actor_id = %self.actor_id(), conn_id = %conn_id, "Connection created");

        if let Some(hook) = self.definition.on_connect.clone() {
            let timeout = self.definition.options.on_connect_timeout;
            let outcome = tokio::time::timeout(timeout, hook(self, conn_id)).await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(_) => Some("on_connect timed out".to_string()),
            };
            if let Some(reason) = failure {
                error!(actor_id = %self.actor_id(), conn_id = %conn_id, error = %reason, "Connect hook failed");
                self.disconnect(&conn_id, Some("connect hook failed".into())).await;
            }
        }

        if let Some(conn) = self.conns.get(&conn_id) {
            conn.send(&ToClient::Init(Init {
                actor_id: self.actor_id(),
                connection_id: conn_id,
                connection_token: token.clone(),
            }));
        }

        Ok(ConnectedConn {
            actor_id: self.actor_id(),
            conn_id,
            token,
        })
    }

    /// Reattaches a client to a connection that survived a transport drop or
    /// a restart.
    pub(crate) fn reconnect(
        &mut self,
        conn_id: &ConnId,
        token: &str,
        sink: Arc<dyn ConnSink>,
    ) -> Result<ConnectedConn, ActorError> {
        self.assert_ready()?;
        let now = self.now_ms();
        let actor_id = self.actor_id();
        let conn = self
            .conns
            .get_mut(conn_id)
            .ok_or(ActorError::ConnNotFound(*conn_id))?;
        if !conn.token.matches(token) {
            warn!(actor_id = %actor_id, conn_id = %conn_id, "Reconnect with incorrect token");
            return Err(ActorError::IncorrectConnToken);
        }

        if let Some(previous) = conn.sink.replace(sink) {
            debug!(conn_id = %conn_id, "Replacing existing transport");
            tokio::spawn(previous.disconnect(Some("replaced by reconnect".into())));
        }
        conn.status = ConnStatus::Connected;
        conn.last_seen = now;
        conn.send(&ToClient::Init(Init {
            actor_id,
            connection_id: *conn_id,
            connection_token: conn.token.clone(),
        }));
        info!(actor_id = %actor_id, conn_id = %conn_id, "Connection reconnected");

        Ok(ConnectedConn {
            actor_id,
            conn_id: *conn_id,
            token: conn.token.clone(),
        })
    }

    /// The transport went away without a clean close.
    pub(crate) fn conn_dropped(&mut self, conn_id: &ConnId) {
        let now = self.now_ms();
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.status = ConnStatus::Reconnecting;
            conn.sink = None;
            conn.last_seen = now;
            debug!(conn_id = %conn_id, "Connection transport dropped");
        }
    }

    /// Closes the transport and removes the connection.
    pub async fn disconnect(&mut self, conn_id: &ConnId, reason: Option<String>) -> bool {
        let sink = self.conns.get(conn_id).and_then(|c| c.sink.clone());
        if let Some(sink) = sink {
            let ceiling = self.definition.options.disconnect_ceiling;
            if tokio::time::timeout(ceiling, sink.disconnect(reason)).await.is_err() {
                warn!(conn_id = %conn_id, "Timed out waiting for transport to close");
            }
        }
        self.remove_conn(conn_id).await
    }

    pub(crate) async fn remove_conn(&mut self, conn_id: &ConnId) -> bool {
        let Some(mut conn) = self.conns.remove(conn_id) else {
            warn!(actor_id = %self.actor_id(), conn_id = %conn_id, "Removing nonexistent connection");
            return false;
        };
        conn.status = ConnStatus::Disconnected;
        conn.sink = None;
        self.mark_dirty();

        if let Err(e) = self.save_immediate(true).await {
            error!(actor_id = %self.actor_id(), conn_id = %conn_id, error = %e, "Failed to persist connection removal");
        }

        if let Some(hook) = self.definition.on_disconnect.clone() {
            if let Err(e) = hook(self, &conn) {
                error!(actor_id = %self.actor_id(), conn_id = %conn_id, error = %e, "Disconnect hook failed");
            }
        }
        info!(actor_id = %self.actor_id(), conn_id = %conn_id, "Connection removed");
        true
    }

    /// Prunes connections that have not been connected for the liveness
    /// timeout.
    pub(crate) async fn check_liveness(&mut self) {
        let timeout_ms =
            u64::try_from(self.definition.options.connection_liveness_timeout.as_millis())
                .unwrap_or(u64::MAX);
        for conn_id in self.conns.stale(self.now_ms(), timeout_ms) {
            info!(actor_id = %self.actor_id(), conn_id = %conn_id, "Pruning stale connection");
            self.remove_conn(&conn_id).await;
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    pub(crate) async fn process_frame(&mut self, conn_id: ConnId, payload: WirePayload) {
        let now = self.now_ms();
        let max_size = self.definition.options.max_incoming_message_size;
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            warn!(actor_id = %self.actor_id(), conn_id = %conn_id, "Frame for unknown connection");
            return;
        };
        conn.last_seen = now;
        let encoding = conn.encoding;

        let message = match parse_message(encoding, &payload, max_size) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "Rejected client message");
                self.send_error(&conn_id, &e, None);
                return;
            }
        };

        match message {
            ToServer::ActionRequest(request) => {
                let id = request.id;
                let outcome = match action_args(request.args) {
                    Ok(args) => self.execute_action(Some(conn_id), &request.name, args).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(output) => {
                        if let Some(conn) = self.conns.get(&conn_id) {
                            conn.send(&ToClient::ActionResponse(ActionResponse { id, output }));
                        }
                    }
                    Err(e) => self.send_error(&conn_id, &e, Some(id)),
                }
            }
            ToServer::SubscriptionRequest(request) => {
                let outcome = if request.subscribe {
                    self.add_subscription(&conn_id, &request.event_name).await
                } else {
                    self.remove_subscription(&conn_id, &request.event_name).await
                };
                if let Err(e) = outcome {
                    self.send_error(&conn_id, &e, None);
                }
            }
        }
    }

    fn send_error(&self, conn_id: &ConnId, err: &ActorError, action_id: Option<u64>) {
        if !err.is_public() {
            error!(actor_id = %self.actor_id(), conn_id = %conn_id, error = %err, "Internal error answering client");
        }
        if let Some(conn) = self.conns.get(conn_id) {
            conn.send(&ToClient::Error(err.to_error_frame(action_id)));
        }
    }

    pub(crate) async fn add_subscription(&mut self, conn_id: &ConnId, event: &str) -> Result<(), ActorError> {
        if !self.conns.subscribe(conn_id, event)? {
            warn!(conn_id = %conn_id, event, "Connection already subscribed");
            return Ok(());
        }
        debug!(conn_id = %conn_id, event, "Subscribed");
        self.mark_dirty();
        self.save_immediate(false).await
    }

    pub(crate) async fn remove_subscription(&mut self, conn_id: &ConnId, event: &str) -> Result<(), ActorError> {
        if !self.conns.unsubscribe(conn_id, event)? {
            warn!(conn_id = %conn_id, event, "Connection was not subscribed");
            return Ok(());
        }
        debug!(conn_id = %conn_id, event, "Unsubscribed");
        self.mark_dirty();
        self.save_immediate(false).await
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Runs a named action under the action timeout.
    ///
    /// `conn_id` is the calling connection, visible to the action through
    /// [`ActorContext::conn_id`]. Any state change is saved on the throttle.
    pub(crate) async fn execute_action(
        &mut self,
        conn_id: Option<ConnId>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ActorError> {
        self.assert_ready()?;
        let action = self
            .definition
            .action(name)
            .ok_or_else(|| ActorError::ActionNotFound(name.to_string()))?;
        let timeout = self.definition.options.action_timeout;

        self.current_conn = conn_id;
        let hook_args = self
            .definition
            .on_before_action_response
            .is_some()
            .then(|| args.clone());
        let call = AssertUnwindSafe(action(&mut *self, args)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, call).await;
        self.current_conn = None;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(actor_id = %self.actor_id(), action = name, "Action panicked");
                Err(ActorError::Internal(format!("action '{name}' panicked")))
            }
            Err(_) => {
                warn!(actor_id = %self.actor_id(), action = name, ?timeout, "Action timed out");
                Err(ActorError::ActionTimedOut)
            }
        };

        let result = match (result, &self.definition.on_before_action_response) {
            (Ok(output), Some(hook)) => {
                let args = hook_args.unwrap_or_default();
                match hook(self, name, &args, output.clone()) {
                    Ok(rewritten) => Ok(rewritten),
                    Err(e) => {
                        error!(actor_id = %self.actor_id(), action = name, error = %e, "Response hook failed, returning original output");
                        Ok(output)
                    }
                }
            }
            (result, _) => result,
        };

        self.save_throttled();
        result
    }

    // =========================================================================
    // Raw requests
    // =========================================================================

    pub(crate) async fn handle_request(&mut self, request: RawRequest) -> Result<RawResponse, ActorError> {
        self.assert_ready()?;
        let Some(handler) = self.definition.on_request.clone() else {
            return Err(ActorError::Unsupported("actor does not handle raw requests".into()));
        };
        let timeout = self.definition.options.action_timeout;
        let call = AssertUnwindSafe(handler(&mut *self, request)).catch_unwind();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActorError::Internal("request handler panicked".into())),
            Err(_) => Err(ActorError::ActionTimedOut),
        };
        self.save_throttled();
        result
    }
}
