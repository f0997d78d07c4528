//! Durable stateful actors.
//!
//! Each actor is a single-threaded unit of state addressed by `(name, key)`.
//! Its state survives restarts through the storage driver; it is loaded on
//! first use and evicted again when the actor goes idle.
//!
//! ## Design Principles
//!
//! - **One task per actor**: an instance owns its state and serves its
//!   mailbox one message at a time
//! - **Dirty-flag persistence**: mutations mark state dirty; saves are
//!   throttled and at most one write per actor is in flight
//! - **Durable schedule**: scheduled events live in the actor record and are
//!   fired through the driver's single alarm per actor
//! - **Reconnectable connections**: connections are persisted and a client
//!   holding the token can resume after a transport drop
//!
//! ## Components
//!
//! - `ActorManager`: resolves queries, starts instances, routes wake signals
//! - `ActorDefinition`: actions and lifecycle hooks for one actor type
//! - `ActorContext`: what actions and hooks see (state, connections, schedule)

mod connection;
mod context;
mod definition;
mod dispatch;
mod errors;
mod framework;
mod instance;
mod manager;
mod persist;
mod schedule;
mod validate;

pub use connection::{ChannelSink, Conn, ConnSink, ConnStatus, SinkClosed, SinkEvent};
pub use context::{ActorContext, ActorState, LifecycleState};
pub use definition::{
    ActionFn, ActionFuture, ActorDefinition, ActorDefinitionBuilder, ConnectParams,
    DefinitionError, HookFuture, RawRequest, RawResponse,
};
pub use dispatch::{ConnectRequest, ConnectedConn};
pub use errors::ActorError;
pub use framework::{
    ActorHandle, ConnSnapshot, InstanceHandle, InstanceMessage, InstanceSnapshot, Message,
    RawStreamGuard,
};
pub use manager::{ActorManager, ActorManagerBuilder, ActorQuery, ManagerError, ManagerStats};
pub use schedule::{Schedule, ScheduledEvent};
