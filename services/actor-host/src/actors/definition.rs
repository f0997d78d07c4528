//! Actor definitions: named actions plus lifecycle hooks.
//!
//! A definition is built once, registered with the manager, and shared by
//! every instance of that actor type.
//!
//! Async hooks take the context by `&mut` and return a boxed future borrowing
//! it, so closures are written as `|ctx, args| Box::pin(async move { .. })`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use ember_id::ConnId;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use super::connection::Conn;
use super::context::{ActorContext, ActorState};
use super::errors::ActorError;
use crate::config::InstanceOptions;
use crate::driver::ActorMetadata;

pub type ActionFuture<'a> = BoxFuture<'a, Result<Value, ActorError>>;
pub type HookFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

pub type ActionFn<S> =
    Arc<dyn for<'a> Fn(&'a mut ActorContext<S>, Vec<Value>) -> ActionFuture<'a> + Send + Sync>;

type LifecycleHook<S> = Arc<dyn for<'a> Fn(&'a mut ActorContext<S>) -> HookFuture<'a> + Send + Sync>;
type CreateHook<S> =
    Arc<dyn for<'a> Fn(&'a mut ActorContext<S>, Option<Value>) -> HookFuture<'a> + Send + Sync>;
type CreateStateFn<S> =
    Arc<dyn Fn(ActorMetadata, Option<Value>) -> BoxFuture<'static, anyhow::Result<S>> + Send + Sync>;
type StateChangeHook<S> = Arc<dyn Fn(&S) -> anyhow::Result<()> + Send + Sync>;
type BeforeConnectHook<S> = Arc<
    dyn for<'a> Fn(&'a mut ActorContext<S>, &'a ConnectParams) -> BoxFuture<'a, Result<(), ActorError>>
        + Send
        + Sync,
>;
type ConnStateFn<S> = Arc<
    dyn for<'a> Fn(&'a mut ActorContext<S>, &'a ConnectParams) -> BoxFuture<'a, anyhow::Result<Value>>
        + Send
        + Sync,
>;
type ConnectHook<S> =
    Arc<dyn for<'a> Fn(&'a mut ActorContext<S>, ConnId) -> HookFuture<'a> + Send + Sync>;
type DisconnectHook<S> = Arc<dyn Fn(&mut ActorContext<S>, &Conn) -> anyhow::Result<()> + Send + Sync>;
type BeforeResponseHook<S> =
    Arc<dyn Fn(&ActorContext<S>, &str, &[Value], Value) -> anyhow::Result<Value> + Send + Sync>;
type RequestHandler<S> = Arc<
    dyn for<'a> Fn(&'a mut ActorContext<S>, RawRequest) -> BoxFuture<'a, Result<RawResponse, ActorError>>
        + Send
        + Sync,
>;
type VarsFn = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// What a client presented when opening a connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectParams {
    pub params: Value,
    pub auth: Option<Value>,
}

/// A raw request routed to the actor's request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("actor definition name must not be empty")]
    EmptyName,

    #[error("action '{0}' is defined more than once")]
    DuplicateAction(String),

    #[error("actor definition '{0}' has no initial state")]
    MissingState(String),
}

pub(crate) enum StateInit<S: ActorState> {
    Static(S),
    Factory(CreateStateFn<S>),
}

pub(crate) enum ConnStateInit<S: ActorState> {
    None,
    Static(Value),
    Factory(ConnStateFn<S>),
}

/// Behavior shared by all instances of one actor type.
pub struct ActorDefinition<S: ActorState> {
    pub(crate) name: String,
    pub(crate) options: InstanceOptions,
    pub(crate) state_init: StateInit<S>,
    pub(crate) actions: HashMap<String, ActionFn<S>>,
    pub(crate) on_create: Option<CreateHook<S>>,
    pub(crate) on_start: Option<LifecycleHook<S>>,
    pub(crate) on_stop: Option<LifecycleHook<S>>,
    pub(crate) on_state_change: Option<StateChangeHook<S>>,
    pub(crate) on_before_connect: Option<BeforeConnectHook<S>>,
    pub(crate) conn_state: ConnStateInit<S>,
    pub(crate) on_connect: Option<ConnectHook<S>>,
    pub(crate) on_disconnect: Option<DisconnectHook<S>>,
    pub(crate) on_before_action_response: Option<BeforeResponseHook<S>>,
    pub(crate) on_request: Option<RequestHandler<S>>,
    pub(crate) vars: Option<VarsFn>,
    pub(crate) database: bool,
}

impl<S: ActorState> ActorDefinition<S> {
    pub fn builder(name: impl Into<String>) -> ActorDefinitionBuilder<S> {
        ActorDefinitionBuilder {
            name: name.into(),
            options: InstanceOptions::default(),
            state_init: None,
            actions: Vec::new(),
            on_create: None,
            on_start: None,
            on_stop: None,
            on_state_change: None,
            on_before_connect: None,
            conn_state: ConnStateInit::None,
            on_connect: None,
            on_disconnect: None,
            on_before_action_response: None,
            on_request: None,
            vars: None,
            database: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub(crate) fn action(&self, name: &str) -> Option<ActionFn<S>> {
        self.actions.get(name).cloned()
    }
}

pub struct ActorDefinitionBuilder<S: ActorState> {
    name: String,
    options: InstanceOptions,
    state_init: Option<StateInit<S>>,
    actions: Vec<(String, ActionFn<S>)>,
    on_create: Option<CreateHook<S>>,
    on_start: Option<LifecycleHook<S>>,
    on_stop: Option<LifecycleHook<S>>,
    on_state_change: Option<StateChangeHook<S>>,
    on_before_connect: Option<BeforeConnectHook<S>>,
    conn_state: ConnStateInit<S>,
    on_connect: Option<ConnectHook<S>>,
    on_disconnect: Option<DisconnectHook<S>>,
    on_before_action_response: Option<BeforeResponseHook<S>>,
    on_request: Option<RequestHandler<S>>,
    vars: Option<VarsFn>,
    database: bool,
}

impl<S: ActorState> ActorDefinitionBuilder<S> {
    /// Initial state cloned into every new actor.
    pub fn state(mut self, initial: S) -> Self {
        self.state_init = Some(StateInit::Static(initial));
        self
    }

    /// Computes the initial state from the actor's identity and input.
    pub fn create_state<F>(mut self, f: F) -> Self
    where
        F: Fn(ActorMetadata, Option<Value>) -> BoxFuture<'static, anyhow::Result<S>>
            + Send
            + Sync
            + 'static,
    {
        self.state_init = Some(StateInit::Factory(Arc::new(f)));
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, Vec<Value>) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        self.actions.push((name.into(), Arc::new(f)));
        self
    }

    /// Registers an action that completes without awaiting.
    pub fn action_sync<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ActorContext<S>, Vec<Value>) -> Result<Value, ActorError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.action(name, move |ctx, args| {
            let result = f(ctx, args);
            Box::pin(async move { result })
        })
    }

    pub fn options(mut self, options: InstanceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_create<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, Option<Value>) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.on_create = Some(Arc::new(f));
        self
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(f));
        self
    }

    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Runs before a connection is created; an error rejects the client.
    pub fn on_before_connect<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, &'a ConnectParams) -> BoxFuture<'a, Result<(), ActorError>>
            + Send
            + Sync
            + 'static,
    {
        self.on_before_connect = Some(Arc::new(f));
        self
    }

    pub fn conn_state(mut self, initial: Value) -> Self {
        self.conn_state = ConnStateInit::Static(initial);
        self
    }

    pub fn create_conn_state<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, &'a ConnectParams) -> BoxFuture<'a, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.conn_state = ConnStateInit::Factory(Arc::new(f));
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, ConnId) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ActorContext<S>, &Conn) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Rewrites action outputs before they are returned to the caller.
    pub fn on_before_action_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActorContext<S>, &str, &[Value], Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.on_before_action_response = Some(Arc::new(f));
        self
    }

    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ActorContext<S>, RawRequest) -> BoxFuture<'a, Result<RawResponse, ActorError>>
            + Send
            + Sync
            + 'static,
    {
        self.on_request = Some(Arc::new(f));
        self
    }

    /// Ephemeral per-instance values, rebuilt on every start.
    pub fn vars<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.vars = Some(Arc::new(move || Box::new(f()) as Box<dyn Any + Send + Sync>));
        self
    }

    /// Requests a per-actor database handle from the driver on start.
    pub fn with_database(mut self) -> Self {
        self.database = true;
        self
    }

    pub fn build(self) -> Result<ActorDefinition<S>, DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        let state_init = self
            .state_init
            .ok_or_else(|| DefinitionError::MissingState(self.name.clone()))?;

        let mut actions = HashMap::with_capacity(self.actions.len());
        for (name, action) in self.actions {
            if actions.contains_key(&name) {
                return Err(DefinitionError::DuplicateAction(name));
            }
            actions.insert(name, action);
        }

        Ok(ActorDefinition {
            name: self.name,
            options: self.options,
            state_init,
            actions,
            on_create: self.on_create,
            on_start: self.on_start,
            on_stop: self.on_stop,
            on_state_change: self.on_state_change,
            on_before_connect: self.on_before_connect,
            conn_state: self.conn_state,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            on_before_action_response: self.on_before_action_response,
            on_request: self.on_request,
            vars: self.vars,
            database: self.database,
        })
    }
}
