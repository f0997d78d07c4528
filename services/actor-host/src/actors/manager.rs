//! Actor manager - root of the actor tree.
//!
//! The manager:
//! - Resolves queries (by id, by key, get-or-create) through the driver
//! - Starts an instance on first use and keeps one live instance per actor
//! - Routes driver wake signals (alarms, sleep requests) to instances
//! - Handles graceful shutdown
//!
//! ## Instance slots
//!
//! ```text
//! ActorManager
//! ├── wake loop (alarms, sleep requests)
//! └── slots: ActorId -> Slot { handle, exited }
//!     └── instance task (removes its own slot on exit)
//! ```
//!
//! A call that reaches an instance which is stopping waits for that
//! instance to exit and retries on a fresh one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use ember_id::{ActorId, ConnId};
use ember_protocol::WirePayload;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::connection::ConnSink;
use super::context::ActorState;
use super::definition::{ActorDefinition, RawRequest, RawResponse};
use super::dispatch::{ConnectRequest, ConnectedConn};
use super::errors::ActorError;
use super::framework::{InstanceHandle, InstanceSnapshot, RawStreamGuard};
use super::instance::{initial_record, spawn_instance, SpawnArgs};
use crate::clock::{Clock, SystemClock};
use crate::driver::{
    ActorDriver, ActorKey, ActorMetadata, ActorRef, Driver, ManagerDriver, StorageError, WakeSignal,
};

/// Attempts per call when instances keep stopping underneath it.
const MAX_ATTEMPTS: u32 = 3;

/// How long a caller waits for a stopping instance to exit.
const STOP_WAIT: Duration = Duration::from_secs(10);

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const DEFAULT_MAILBOX_SIZE: usize = 256;

// =============================================================================
// Queries
// =============================================================================

/// How a caller addresses an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorQuery {
    GetForId {
        actor_id: ActorId,
    },
    GetForKey {
        name: String,
        key: ActorKey,
    },
    GetOrCreateForKey {
        name: String,
        key: ActorKey,
        #[serde(default)]
        input: Option<Value>,
    },
    Create {
        name: String,
        key: ActorKey,
        #[serde(default)]
        input: Option<Value>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("actor definition '{0}' is registered more than once")]
    DuplicateDefinition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub active: usize,
    pub started: u64,
    pub stopped: u64,
}

// =============================================================================
// Factories
// =============================================================================

/// Type-erased actor definition.
trait ActorFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn spawn(&self, args: SpawnArgs) -> (InstanceHandle, JoinHandle<()>);
}

struct Registered<S: ActorState>(Arc<ActorDefinition<S>>);

impl<S: ActorState> ActorFactory for Registered<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn spawn(&self, args: SpawnArgs) -> (InstanceHandle, JoinHandle<()>) {
        spawn_instance(Arc::clone(&self.0), args)
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct ActorManagerBuilder {
    actor_driver: Arc<dyn ActorDriver>,
    manager_driver: Arc<dyn ManagerDriver>,
    clock: Arc<dyn Clock>,
    factories: Vec<Arc<dyn ActorFactory>>,
    mailbox_size: usize,
}

impl ActorManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mailbox_size(mut self, size: usize) -> Self {
        self.mailbox_size = size.max(1);
        self
    }

    pub fn register<S: ActorState>(mut self, definition: ActorDefinition<S>) -> Self {
        self.factories
            .push(Arc::new(Registered(Arc::new(definition))));
        self
    }

    /// Builds the manager and starts its wake loop. Must be called from
    /// within a tokio runtime.
    pub fn build(self, shutdown: watch::Receiver<bool>) -> Result<ActorManager, ManagerError> {
        let mut factories = HashMap::with_capacity(self.factories.len());
        for factory in self.factories {
            let name = factory.name().to_string();
            if factories.insert(name.clone(), factory).is_some() {
                return Err(ManagerError::DuplicateDefinition(name));
            }
        }

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            factories,
            actor_driver: self.actor_driver,
            manager_driver: self.manager_driver,
            clock: self.clock,
            slots: Mutex::new(HashMap::new()),
            wake_tx,
            shutdown: shutdown.clone(),
            mailbox_size: self.mailbox_size,
            generation: AtomicU64::new(0),
            started: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
        });

        tokio::spawn(run_wake_loop(Arc::downgrade(&inner), wake_rx, shutdown));
        info!(definitions = inner.factories.len(), "Actor manager started");
        Ok(ActorManager { inner })
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Clone)]
pub struct ActorManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    factories: HashMap<String, Arc<dyn ActorFactory>>,
    actor_driver: Arc<dyn ActorDriver>,
    manager_driver: Arc<dyn ManagerDriver>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<ActorId, Slot>>,
    wake_tx: mpsc::UnboundedSender<WakeSignal>,
    shutdown: watch::Receiver<bool>,
    mailbox_size: usize,
    generation: AtomicU64,
    started: AtomicU64,
    stopped: AtomicU64,
}

struct Slot {
    generation: u64,
    handle: InstanceHandle,
    exited: watch::Receiver<bool>,
    abort: AbortHandle,
}

impl ManagerInner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ActorId, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self, actor_id: ActorId, generation: u64) {
        let mut slots = self.lock_slots();
        if slots
            .get(&actor_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.remove(&actor_id);
        }
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }
}

impl ActorManager {
    pub fn builder<D: Driver>(driver: Arc<D>) -> ActorManagerBuilder {
        let actor_driver: Arc<dyn ActorDriver> = driver.clone();
        let manager_driver: Arc<dyn ManagerDriver> = driver;
        ActorManagerBuilder {
            actor_driver,
            manager_driver,
            clock: Arc::new(SystemClock::new()),
            factories: Vec::new(),
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    pub async fn resolve(&self, query: &ActorQuery) -> Result<ActorId, ActorError> {
        let driver = &self.inner.manager_driver;
        match query {
            ActorQuery::GetForId { actor_id } => driver
                .get_for_id(actor_id)
                .await?
                .map(|meta| meta.id)
                .ok_or_else(|| ActorError::ActorNotFound(actor_id.to_string())),
            ActorQuery::GetForKey { name, key } => driver
                .get_for_key(name, key)
                .await?
                .map(|meta| meta.id)
                .ok_or_else(|| ActorError::ActorNotFound(format!("{name} {key}"))),
            ActorQuery::GetOrCreateForKey { name, key, input } => {
                if let Some(meta) = driver.get_for_key(name, key).await? {
                    return Ok(meta.id);
                }
                match self.create(name, key, input.clone()).await {
                    Err(ActorError::ActorAlreadyExists(_)) => driver
                        .get_for_key(name, key)
                        .await?
                        .map(|meta| meta.id)
                        .ok_or_else(|| ActorError::ActorNotFound(format!("{name} {key}"))),
                    other => other,
                }
            }
            ActorQuery::Create { name, key, input } => self.create(name, key, input.clone()).await,
        }
    }

    async fn create(&self, name: &str, key: &ActorKey, input: Option<Value>) -> Result<ActorId, ActorError> {
        if !self.inner.factories.contains_key(name) {
            return Err(ActorError::UnknownDefinition(name.to_string()));
        }
        let metadata = ActorMetadata {
            id: ActorId::new(),
            name: name.to_string(),
            key: key.clone(),
        };
        match self
            .inner
            .manager_driver
            .create_actor(&metadata, initial_record(input)?)
            .await
        {
            Ok(()) => {
                info!(actor_id = %metadata.id, name, key = %key, "Created actor");
                Ok(metadata.id)
            }
            Err(StorageError::AlreadyExists(what)) => Err(ActorError::ActorAlreadyExists(what)),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Instances
    // =========================================================================

    fn live(&self, actor_id: &ActorId) -> Option<(InstanceHandle, watch::Receiver<bool>)> {
        self.inner
            .lock_slots()
            .get(actor_id)
            .map(|slot| (slot.handle.clone(), slot.exited.clone()))
    }

    /// Returns the live instance, starting one if needed.
    async fn instance(&self, actor_id: ActorId) -> Result<(InstanceHandle, watch::Receiver<bool>), ActorError> {
        if let Some(found) = self.live(&actor_id) {
            return Ok(found);
        }

        let metadata = self
            .inner
            .manager_driver
            .get_for_id(&actor_id)
            .await?
            .ok_or_else(|| ActorError::ActorNotFound(actor_id.to_string()))?;
        let factory = self
            .inner
            .factories
            .get(&metadata.name)
            .cloned()
            .ok_or_else(|| ActorError::UnknownDefinition(metadata.name.clone()))?;

        let mut slots = self.inner.lock_slots();
        if let Some(slot) = slots.get(&actor_id) {
            return Ok((slot.handle.clone(), slot.exited.clone()));
        }

        let name = metadata.name.clone();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (handle, task) = factory.spawn(SpawnArgs {
            metadata,
            driver: Arc::clone(&self.inner.actor_driver),
            actor_ref: ActorRef::new(actor_id, self.inner.wake_tx.clone()),
            clock: Arc::clone(&self.inner.clock),
            shutdown: self.inner.shutdown.clone(),
            mailbox_size: self.inner.mailbox_size,
        });
        let abort = task.abort_handle();
        let (exited_tx, exited_rx) = watch::channel(false);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(actor_id = %actor_id, "Actor task panicked");
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.release(actor_id, generation);
            }
            exited_tx.send_replace(true);
        });

        slots.insert(
            actor_id,
            Slot {
                generation,
                handle: handle.clone(),
                exited: exited_rx.clone(),
                abort,
            },
        );
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        info!(actor_id = %actor_id, name = %name, "Started actor instance");
        Ok((handle, exited_rx))
    }

    /// Runs `op` against the live instance, retrying on a fresh instance
    /// when the current one is stopping.
    async fn with_instance<T, F, Fut>(&self, actor_id: ActorId, mut op: F) -> Result<T, ActorError>
    where
        F: FnMut(InstanceHandle) -> Fut,
        Fut: Future<Output = Result<T, ActorError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (handle, mut exited) = self.instance(actor_id).await?;
            match op(handle).await {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    debug!(actor_id = %actor_id, attempt, error = %e, "Instance is stopping, retrying");
                    let waited = tokio::time::timeout(STOP_WAIT, exited.wait_for(|done| *done)).await;
                    if waited.is_err() {
                        warn!(actor_id = %actor_id, "Timed out waiting for stopping instance to exit");
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn connect(&self, query: &ActorQuery, request: ConnectRequest) -> Result<ConnectedConn, ActorError> {
        let actor_id = self.resolve(query).await?;
        self.with_instance(actor_id, |handle| {
            let request = request.clone();
            async move { handle.connect(request).await }
        })
        .await
    }

    pub async fn reconnect(
        &self,
        actor_id: ActorId,
        conn_id: ConnId,
        token: &str,
        sink: Arc<dyn ConnSink>,
    ) -> Result<ConnectedConn, ActorError> {
        self.with_instance(actor_id, |handle| {
            let sink = Arc::clone(&sink);
            let token = token.to_string();
            async move { handle.reconnect(conn_id, token, sink).await }
        })
        .await
    }

    /// Delivers a client frame to a running instance.
    pub async fn send_frame(&self, actor_id: ActorId, conn_id: ConnId, payload: WirePayload) -> Result<(), ActorError> {
        let (handle, _) = self.live(&actor_id).ok_or(ActorError::ActorStopped)?;
        handle.send_frame(conn_id, payload).await
    }

    pub async fn conn_dropped(&self, actor_id: ActorId, conn_id: ConnId) {
        if let Some((handle, _)) = self.live(&actor_id) {
            let _ = handle.conn_dropped(conn_id).await;
        }
    }

    pub async fn close_conn(&self, actor_id: ActorId, conn_id: ConnId) -> bool {
        match self.live(&actor_id) {
            Some((handle, _)) => handle.close_conn(conn_id).await.unwrap_or(false),
            None => false,
        }
    }

    pub async fn call_action(&self, query: &ActorQuery, name: &str, args: Vec<Value>) -> Result<Value, ActorError> {
        let actor_id = self.resolve(query).await?;
        self.with_instance(actor_id, |handle| {
            let args = args.clone();
            async move { handle.call_action(name, args).await }
        })
        .await
    }

    pub async fn handle_request(&self, query: &ActorQuery, request: RawRequest) -> Result<RawResponse, ActorError> {
        let actor_id = self.resolve(query).await?;
        self.with_instance(actor_id, |handle| {
            let request = request.clone();
            async move { handle.request(request).await }
        })
        .await
    }

    pub async fn open_raw_stream(&self, actor_id: ActorId) -> Result<RawStreamGuard, ActorError> {
        self.with_instance(actor_id, |handle| async move { handle.open_raw_stream().await })
            .await
    }

    /// Snapshot of a running instance; `None` when the actor is not running.
    pub async fn inspect(&self, actor_id: ActorId) -> Result<Option<InstanceSnapshot>, ActorError> {
        match self.live(&actor_id) {
            Some((handle, _)) => handle.inspect().await.map(Some),
            None => Ok(None),
        }
    }

    pub fn is_active(&self, actor_id: &ActorId) -> bool {
        self.live(actor_id).is_some()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active: self.inner.lock_slots().len(),
            started: self.inner.started.load(Ordering::Relaxed),
            stopped: self.inner.stopped.load(Ordering::Relaxed),
        }
    }

    /// Stops a running instance and waits for it to exit. Returns false if
    /// it was not running.
    pub async fn stop_actor(&self, actor_id: ActorId) -> bool {
        let Some((handle, mut exited)) = self.live(&actor_id) else {
            return false;
        };
        if let Err(e) = handle.stop().await {
            debug!(actor_id = %actor_id, error = %e, "Stop request found instance already gone");
        }
        if tokio::time::timeout(STOP_WAIT, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(actor_id = %actor_id, "Timed out waiting for actor to stop");
        }
        true
    }

    /// Re-arms alarms that were pending when the host last ran.
    pub async fn restore_alarms(&self) -> Result<usize, ActorError> {
        let pending = self.inner.manager_driver.pending_alarms().await?;
        for (actor_id, timestamp_ms) in &pending {
            let actor_ref = ActorRef::new(*actor_id, self.inner.wake_tx.clone());
            self.inner
                .actor_driver
                .set_alarm(&actor_ref, *timestamp_ms)
                .await?;
        }
        info!(count = pending.len(), "Restored pending alarms");
        Ok(pending.len())
    }

    /// Stops all instances.
    pub async fn shutdown(&self) {
        let running: Vec<(ActorId, InstanceHandle, watch::Receiver<bool>, AbortHandle)> = self
            .inner
            .lock_slots()
            .iter()
            .map(|(id, slot)| (*id, slot.handle.clone(), slot.exited.clone(), slot.abort.clone()))
            .collect();
        info!(count = running.len(), "Stopping all actors");

        let stops = running.iter().map(|(_, handle, exited, _)| {
            let handle = handle.clone();
            let mut exited = exited.clone();
            async move {
                let _ = handle.stop().await;
                let _ = exited.wait_for(|done| *done).await;
            }
        });
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all(stops))
            .await
            .is_err()
        {
            for (actor_id, _, exited, abort) in &running {
                if !*exited.borrow() {
                    warn!(actor_id = %actor_id, "Force aborting actor");
                    abort.abort();
                }
            }
        }
    }

    async fn handle_wake(&self, signal: WakeSignal) {
        match signal {
            WakeSignal::Alarm(actor_id) => {
                debug!(actor_id = %actor_id, "Delivering alarm");
                if let Err(e) = self
                    .with_instance(actor_id, |handle| async move { handle.alarm().await })
                    .await
                {
                    error!(actor_id = %actor_id, error = %e, "Failed to deliver alarm");
                }
            }
            WakeSignal::Sleep(actor_id) => {
                debug!(actor_id = %actor_id, "Stopping sleeping actor");
                self.stop_actor(actor_id).await;
            }
        }
    }
}

// =============================================================================
// Wake loop
// =============================================================================

async fn run_wake_loop(
    inner: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<WakeSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Wake loop shutting down");
                    break;
                }
            }

            signal = rx.recv() => {
                let Some(signal) = signal else { break };
                let Some(inner) = inner.upgrade() else { break };
                let manager = ActorManager { inner };
                tokio::spawn(async move { manager.handle_wake(signal).await });
            }
        }
    }
}
