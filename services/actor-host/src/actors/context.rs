//! The handle actor code receives in every action and hook.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_id::{ActorId, ConnId};
use ember_protocol::{EventFrame, ToClient};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::connection::{Conn, ConnectionManager};
use super::definition::ActorDefinition;
use super::errors::ActorError;
use super::schedule::{EventQueue, Schedule};
use super::validate::check_serializable;
use crate::clock::Clock;
use crate::driver::{ActorDriver, ActorKey, ActorMetadata, ActorRef, DatabaseHandle};
use crate::write_queue::WriteQueue;

/// Bound for actor state types.
///
/// State is cloned before each mutation so a rejected write can be rolled
/// back, and encoded as MessagePack when persisted.
pub trait ActorState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> ActorState for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    /// Sleep was requested from the driver; a stop is on its way.
    Sleeping,
    Stopping,
    Stopped,
}

/// Storage plumbing shared by an instance and its in-flight writes.
pub(crate) struct Backend {
    pub driver: Arc<dyn ActorDriver>,
    pub actor_ref: ActorRef,
    pub clock: Arc<dyn Clock>,
    pub persist_queue: WriteQueue,
    pub alarm_queue: WriteQueue,
    pub dirty: Arc<AtomicBool>,
}

impl Backend {
    pub fn new(driver: Arc<dyn ActorDriver>, actor_ref: ActorRef, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            actor_ref,
            clock,
            persist_queue: WriteQueue::new("persist"),
            alarm_queue: WriteQueue::new("alarm"),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct ActorContext<S: ActorState> {
    pub(crate) metadata: ActorMetadata,
    pub(crate) definition: Arc<ActorDefinition<S>>,
    pub(crate) backend: Backend,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) state: S,
    pub(crate) input: Option<Value>,
    pub(crate) conns: ConnectionManager,
    pub(crate) schedule: EventQueue,
    pub(crate) current_conn: Option<ConnId>,
    pub(crate) background: Vec<JoinHandle<()>>,
    pub(crate) abort_tx: watch::Sender<bool>,
    pub(crate) vars: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) database: Option<DatabaseHandle>,
    pub(crate) sleep_requested: bool,
    pub(crate) last_save_ms: u64,
    pub(crate) save_deadline: Option<tokio::time::Instant>,
}

impl<S: ActorState> ActorContext<S> {
    pub(crate) fn new(
        metadata: ActorMetadata,
        definition: Arc<ActorDefinition<S>>,
        backend: Backend,
        state: S,
        input: Option<Value>,
        conns: ConnectionManager,
        schedule: EventQueue,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            metadata,
            definition,
            backend,
            lifecycle: LifecycleState::Initializing,
            state,
            input,
            conns,
            schedule,
            current_conn: None,
            background: Vec::new(),
            abort_tx,
            vars: None,
            database: None,
            sleep_requested: false,
            last_save_ms: 0,
            save_deadline: None,
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn actor_id(&self) -> ActorId {
        self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn key(&self) -> &ActorKey {
        &self.metadata.key
    }

    pub fn metadata(&self) -> &ActorMetadata {
        &self.metadata
    }

    /// Input given when the actor was created.
    pub fn input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn now_ms(&self) -> u64 {
        self.backend.clock.now_ms()
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Applies `f` to the state and marks it for persistence.
    ///
    /// If the result cannot be serialized the previous state is restored
    /// and [`ActorError::InvalidStateType`] names the offending location.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut S) -> R) -> Result<R, ActorError> {
        if self.lifecycle == LifecycleState::Stopped {
            return Err(ActorError::ActorStopped);
        }

        let previous = self.state.clone();
        let out = f(&mut self.state);
        if let Err(invalid) = check_serializable(&self.state) {
            self.state = previous;
            return Err(ActorError::InvalidStateType {
                path: invalid.path,
                reason: invalid.reason,
            });
        }

        self.mark_dirty();
        self.notify_state_change();
        Ok(out)
    }

    pub fn set_state(&mut self, state: S) -> Result<(), ActorError> {
        self.mutate(|current| *current = state)
    }

    fn notify_state_change(&self) {
        if !matches!(
            self.lifecycle,
            LifecycleState::Ready | LifecycleState::Sleeping | LifecycleState::Stopping
        ) {
            return;
        }
        let Some(hook) = &self.definition.on_state_change else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&self.state)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(actor_id = %self.actor_id(), error = %e, "State change hook failed"),
            Err(_) => error!(actor_id = %self.actor_id(), "State change hook panicked"),
        }
    }

    // =========================================================================
    // Connections and events
    // =========================================================================

    /// The connection whose message is being handled, if any.
    pub fn conn_id(&self) -> Option<ConnId> {
        self.current_conn
    }

    pub fn conn(&self, id: &ConnId) -> Option<&Conn> {
        self.conns.get(id)
    }

    pub fn conns(&self) -> impl Iterator<Item = &Conn> {
        self.conns.iter()
    }

    pub fn set_conn_state(&mut self, id: &ConnId, state: Value) -> Result<(), ActorError> {
        let conn = self.conns.get_mut(id).ok_or(ActorError::ConnNotFound(*id))?;
        conn.state = Some(state);
        self.mark_dirty();
        self.save_throttled();
        Ok(())
    }

    /// Sends an event to every connection subscribed to `name`.
    pub fn broadcast(&self, name: &str, args: Vec<Value>) -> usize {
        let delivered = self.conns.broadcast(name, args);
        debug!(actor_id = %self.actor_id(), event = name, delivered, "Broadcast event");
        delivered
    }

    /// Sends an event to a single connection, subscribed or not.
    pub fn send(&self, id: &ConnId, name: &str, args: Vec<Value>) -> Result<(), ActorError> {
        let conn = self.conns.get(id).ok_or(ActorError::ConnNotFound(*id))?;
        conn.send(&ToClient::Event(EventFrame {
            name: name.to_string(),
            args: Value::Array(args),
        }));
        Ok(())
    }

    // =========================================================================
    // Scheduling and background work
    // =========================================================================

    pub fn schedule(&mut self) -> Schedule<'_, S> {
        Schedule::new(self)
    }

    /// Runs `fut` in the background. Stopping waits for it, up to the
    /// configured limit.
    pub fn wait_until<F>(&mut self, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let actor_id = self.actor_id();
        self.background.retain(|task| !task.is_finished());
        self.background.push(tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(actor_id = %actor_id, error = %e, "Background task failed");
            }
        }));
    }

    /// Flips to `true` when the actor begins stopping.
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    /// Asks the host to put this actor to sleep after the current message.
    pub fn sleep(&mut self) {
        if !self.backend.driver.supports_sleep() {
            warn!(actor_id = %self.actor_id(), "Sleep requested but the driver does not support it");
            return;
        }
        self.sleep_requested = true;
    }

    /// Writes the state now instead of waiting for the throttle.
    pub async fn save_state(&mut self) -> Result<(), ActorError> {
        self.save_immediate(false).await
    }

    pub fn vars<T: Any>(&self) -> Option<&T> {
        self.vars.as_deref()?.downcast_ref::<T>()
    }

    pub fn vars_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.vars.as_deref_mut()?.downcast_mut::<T>()
    }

    /// The driver's database handle, when the definition asked for one.
    pub fn database(&self) -> Option<DatabaseHandle> {
        self.database.clone()
    }

    pub(crate) fn assert_ready(&self) -> Result<(), ActorError> {
        match self.lifecycle {
            LifecycleState::Ready | LifecycleState::Sleeping => Ok(()),
            LifecycleState::Uninitialized | LifecycleState::Initializing => Err(ActorError::NotReady),
            LifecycleState::Stopping | LifecycleState::Stopped => Err(ActorError::Stopping),
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.backend.dirty.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ready_context;
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Reading {
        value: f64,
    }

    fn definition() -> ActorDefinition<Reading> {
        ActorDefinition::builder("sensor")
            .state(Reading::default())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_mutation_rolls_back() {
        let (mut ctx, _driver) = ready_context(definition(), Reading { value: 1.0 });

        let err = ctx.mutate(|s| s.value = f64::NAN).unwrap_err();
        assert_eq!(
            err,
            ActorError::InvalidStateType {
                path: "state.value".into(),
                reason: "non-finite number".into(),
            }
        );
        assert_eq!(ctx.state().value, 1.0);
        assert!(!ctx.is_dirty());
    }

    #[tokio::test]
    async fn test_mutation_marks_dirty_and_notifies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let definition = ActorDefinition::builder("sensor")
            .state(Reading::default())
            .on_state_change(move |_: &Reading| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let (mut ctx, _driver) = ready_context(definition, Reading::default());

        ctx.set_state(Reading { value: 2.5 }).unwrap();
        assert!(ctx.is_dirty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_state_change_hook_before_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let definition = ActorDefinition::builder("sensor")
            .state(Reading::default())
            .on_state_change(move |_: &Reading| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let (mut ctx, _driver) = ready_context(definition, Reading::default());
        ctx.lifecycle = LifecycleState::Initializing;

        ctx.set_state(Reading { value: 1.0 }).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_vars_downcast() {
        let (mut ctx, _driver) = ready_context(definition(), Reading::default());
        ctx.vars = Some(Box::new(vec![1u8, 2, 3]));

        assert_eq!(ctx.vars::<Vec<u8>>().map(Vec::len), Some(3));
        assert!(ctx.vars::<String>().is_none());
        ctx.vars_mut::<Vec<u8>>().unwrap().push(4);
        assert_eq!(ctx.vars::<Vec<u8>>().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn test_assert_ready_by_lifecycle() {
        let (mut ctx, _driver) = ready_context(definition(), Reading::default());
        assert!(ctx.assert_ready().is_ok());

        ctx.lifecycle = LifecycleState::Initializing;
        assert_eq!(ctx.assert_ready(), Err(ActorError::NotReady));

        ctx.lifecycle = LifecycleState::Stopping;
        assert_eq!(ctx.assert_ready(), Err(ActorError::Stopping));
    }
}
