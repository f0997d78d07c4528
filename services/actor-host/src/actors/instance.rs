//! Actor instance task.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──► Initializing ──► Ready ──► Sleeping ──► Stopping ──► Stopped
//!                        │                          ▲           ▲
//!                        └── start failed ──────────┴───────────┘
//! ```
//!
//! Startup loads the persisted record (creating the state on first start),
//! re-arms the head alarm, and prunes stale connections. The loop then
//! serves the mailbox alongside three timers: connection liveness, the
//! throttled save deadline, and the sleep deadline.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_protocol::{decode_typed, persisted_actor_codec, PersistedActor};
use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection::{ConnStatus, ConnectionManager};
use super::context::{ActorContext, ActorState, Backend, LifecycleState};
use super::definition::{ActorDefinition, StateInit};
use super::errors::ActorError;
use super::framework::{ActorHandle, ConnSnapshot, InstanceHandle, InstanceMessage, InstanceSnapshot};
use super::schedule::EventQueue;
use crate::clock::Clock;
use crate::driver::{ActorDriver, ActorMetadata, ActorRef};

/// Consecutive early alarms before the warning escalates to an error.
const EARLY_ALARM_ERROR_STREAK: u32 = 3;

/// Everything an instance task needs from its host.
pub(crate) struct SpawnArgs {
    pub metadata: ActorMetadata,
    pub driver: Arc<dyn ActorDriver>,
    pub actor_ref: ActorRef,
    pub clock: Arc<dyn Clock>,
    pub shutdown: watch::Receiver<bool>,
    pub mailbox_size: usize,
}

/// Spawns an instance task. Messages sent before startup completes are
/// queued and served once the actor is ready.
pub(crate) fn spawn_instance<S: ActorState>(
    definition: Arc<ActorDefinition<S>>,
    args: SpawnArgs,
) -> (InstanceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(args.mailbox_size);
    let handle = ActorHandle::new(args.metadata.id, tx);
    let task = tokio::spawn(run_instance(definition, args, rx));
    (handle, task)
}

async fn run_instance<S: ActorState>(
    definition: Arc<ActorDefinition<S>>,
    args: SpawnArgs,
    mut rx: mpsc::Receiver<InstanceMessage>,
) {
    let actor_id = args.metadata.id;
    let shutdown = args.shutdown.clone();
    debug!(actor_id = %actor_id, from = ?LifecycleState::Uninitialized, to = ?LifecycleState::Initializing, "Lifecycle transition");

    let ctx = match start(definition, args).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(actor_id = %actor_id, error = %e, "Actor failed to start");
            rx.close();
            while let Ok(msg) = rx.try_recv() {
                msg.reject(e.clone());
            }
            return;
        }
    };

    let mut instance = ActorInstance {
        ctx,
        sleep_deadline: None,
        raw_streams: HashSet::new(),
        active_requests: 0,
        early_alarms: 0,
    };
    instance.reset_sleep_timer();
    instance.run(rx, shutdown).await;
}

// =============================================================================
// Startup
// =============================================================================

async fn start<S: ActorState>(
    definition: Arc<ActorDefinition<S>>,
    args: SpawnArgs,
) -> Result<ActorContext<S>, ActorError> {
    let actor_id = args.metadata.id;
    let options = definition.options.clone();

    let raw = args
        .driver
        .read_persisted_data(&actor_id)
        .await?
        .ok_or_else(|| ActorError::ActorNotFound(actor_id.to_string()))?;
    let record = persisted_actor_codec().deserialize_with_embedded_version(&raw)?;

    let backend = Backend::new(Arc::clone(&args.driver), args.actor_ref, args.clock);
    let mut ctx = if record.has_initialized {
        restore(definition, args.metadata, backend, record)?
    } else {
        create(definition, args.metadata, backend, record, options.create_state_timeout).await?
    };
    ctx.last_save_ms = ctx.now_ms();

    if let Some(vars) = &ctx.definition.vars {
        ctx.vars = Some(vars());
    }
    if ctx.definition.database {
        ctx.database = ctx.backend.driver.get_database(&actor_id).await?;
        if ctx.database.is_none() {
            warn!(actor_id = %actor_id, "Definition requested a database but the driver has none");
        }
    }

    if let Some(hook) = ctx.definition.on_start.clone() {
        hook(&mut ctx).await?;
    }

    if let Some(head) = ctx.schedule.head().map(|e| e.timestamp) {
        ctx.arm_alarm(head).await?;
    }

    ctx.lifecycle = LifecycleState::Ready;
    info!(
        actor_id = %actor_id,
        name = %ctx.name(),
        connections = ctx.conns.len(),
        scheduled = ctx.schedule.len(),
        "Actor ready"
    );

    ctx.check_liveness().await;
    Ok(ctx)
}

fn restore<S: ActorState>(
    definition: Arc<ActorDefinition<S>>,
    metadata: ActorMetadata,
    backend: Backend,
    record: PersistedActor,
) -> Result<ActorContext<S>, ActorError> {
    let bytes = record
        .state
        .ok_or_else(|| ActorError::Internal("initialized record has no state".into()))?;
    let state: S = decode_typed(&bytes)?;
    debug!(actor_id = %metadata.id, "Restoring persisted actor");

    Ok(ActorContext::new(
        metadata,
        definition,
        backend,
        state,
        record.input,
        ConnectionManager::restore(record.connections),
        EventQueue::restore(record.scheduled_events),
    ))
}

/// First start: builds the state, writes the first record directly, then
/// runs `on_create`.
async fn create<S: ActorState>(
    definition: Arc<ActorDefinition<S>>,
    metadata: ActorMetadata,
    backend: Backend,
    record: PersistedActor,
    timeout: Duration,
) -> Result<ActorContext<S>, ActorError> {
    info!(actor_id = %metadata.id, name = %metadata.name, "Creating actor state");

    let state = match &definition.state_init {
        StateInit::Static(initial) => initial.clone(),
        StateInit::Factory(create_state) => {
            let fut = create_state(metadata.clone(), record.input.clone());
            tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| ActorError::Internal("creating state timed out".into()))??
        }
    };

    let mut ctx = ActorContext::new(
        metadata,
        definition,
        backend,
        state,
        record.input.clone(),
        ConnectionManager::default(),
        EventQueue::default(),
    );

    let data = ctx.encode_record()?;
    ctx.backend
        .driver
        .write_persisted_data(&ctx.actor_id(), data)
        .await?;

    if let Some(hook) = ctx.definition.on_create.clone() {
        let input = ctx.input.clone();
        hook(&mut ctx, input).await?;
    }
    Ok(ctx)
}

// =============================================================================
// Run loop
// =============================================================================

struct ActorInstance<S: ActorState> {
    ctx: ActorContext<S>,
    sleep_deadline: Option<Instant>,
    raw_streams: HashSet<u64>,
    active_requests: usize,
    early_alarms: u32,
}

/// Resolves at `deadline`, or never when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<S: ActorState> ActorInstance<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<InstanceMessage>, mut shutdown: watch::Receiver<bool>) {
        let actor_id = self.ctx.actor_id();
        let mut liveness = tokio::time::interval_at(
            Instant::now() + self.ctx.definition.options.connection_liveness_interval,
            self.ctx.definition.options.connection_liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let save_at = self.ctx.save_deadline;
            let sleep_at = self.sleep_deadline;

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(actor_id = %actor_id, "Actor received shutdown signal");
                        self.stop().await;
                        break;
                    }
                }

                msg = rx.recv() => {
                    match msg {
                        Some(InstanceMessage::Stop { reply }) => {
                            self.stop().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(msg) => self.handle(msg).await,
                        None => {
                            debug!(actor_id = %actor_id, "Mailbox closed");
                            self.stop().await;
                            break;
                        }
                    }
                }

                _ = liveness.tick() => {
                    self.ctx.check_liveness().await;
                    self.refresh_sleep_timer();
                }

                _ = until(save_at) => {
                    self.ctx.save_deadline = None;
                    if let Err(e) = self.ctx.start_save() {
                        error!(actor_id = %actor_id, error = %e, "Failed to save actor record");
                    }
                }

                _ = until(sleep_at) => {
                    self.sleep_deadline = None;
                    if self.can_sleep() {
                        self.sleep();
                    }
                }
            }

            if std::mem::take(&mut self.ctx.sleep_requested) {
                self.sleep();
            }
        }

        rx.close();
        let host_stopping = *shutdown.borrow();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                // Due events are still in the record; wake the next instance.
                InstanceMessage::Alarm if !host_stopping => {
                    debug!(actor_id = %actor_id, "Re-routing alarm received while stopping");
                    self.ctx.backend.actor_ref.fire_alarm();
                }
                other => other.reject(ActorError::Stopping),
            }
        }
        info!(actor_id = %actor_id, "Actor stopped");
    }

    async fn handle(&mut self, msg: InstanceMessage) {
        let is_activity = !matches!(msg, InstanceMessage::Inspect { .. });

        match msg {
            InstanceMessage::Connect { request, reply } => {
                let _ = reply.send(self.ctx.connect(request).await);
            }
            InstanceMessage::Reconnect {
                conn_id,
                token,
                sink,
                reply,
            } => {
                let _ = reply.send(self.ctx.reconnect(&conn_id, &token, sink));
            }
            InstanceMessage::Frame { conn_id, payload } => {
                self.ctx.process_frame(conn_id, payload).await;
            }
            InstanceMessage::ConnDropped { conn_id } => self.ctx.conn_dropped(&conn_id),
            InstanceMessage::ConnClosed { conn_id, reply } => {
                let removed = self.ctx.remove_conn(&conn_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            InstanceMessage::Action { name, args, reply } => {
                let _ = reply.send(self.ctx.execute_action(None, &name, args).await);
            }
            InstanceMessage::Request { request, reply } => {
                self.active_requests += 1;
                let result = self.ctx.handle_request(request).await;
                self.active_requests -= 1;
                let _ = reply.send(result);
            }
            InstanceMessage::RawStreamOpened { stream_id } => {
                self.raw_streams.insert(stream_id);
            }
            InstanceMessage::RawStreamClosed { stream_id } => {
                self.raw_streams.remove(&stream_id);
            }
            InstanceMessage::Alarm => self.on_alarm().await,
            InstanceMessage::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
            InstanceMessage::Stop { reply } => {
                // Handled by the loop; only reachable if routed here directly.
                self.stop().await;
                let _ = reply.send(());
            }
        }

        if is_activity {
            self.reset_sleep_timer();
        }
    }

    // =========================================================================
    // Alarms
    // =========================================================================

    async fn on_alarm(&mut self) {
        let actor_id = self.ctx.actor_id();
        let now = self.ctx.now_ms();
        let due = self.ctx.schedule.take_due(now);

        if due.is_empty() {
            let Some(head) = self.ctx.schedule.head().map(|e| e.timestamp) else {
                debug!(actor_id = %actor_id, "Alarm fired with nothing scheduled");
                return;
            };
            self.early_alarms += 1;
            if self.early_alarms >= EARLY_ALARM_ERROR_STREAK {
                error!(actor_id = %actor_id, now_ms = now, head_ms = head, streak = self.early_alarms, "Alarm keeps firing before the next event");
            } else {
                warn!(actor_id = %actor_id, now_ms = now, head_ms = head, "Alarm fired early, rearming");
            }
            if let Err(e) = self.ctx.arm_alarm(head).await {
                error!(actor_id = %actor_id, error = %e, "Failed to rearm alarm");
            }
            return;
        }

        self.early_alarms = 0;
        self.ctx.mark_dirty();
        if let Some(next) = self.ctx.schedule.head().map(|e| e.timestamp) {
            if let Err(e) = self.ctx.arm_alarm(next).await {
                error!(actor_id = %actor_id, error = %e, "Failed to arm next alarm");
            }
        }

        for event in due {
            debug!(actor_id = %actor_id, event_id = %event.id, action = %event.action, "Running scheduled event");
            if let Err(e) = self.ctx.execute_action(None, &event.action, event.args).await {
                error!(actor_id = %actor_id, event_id = %event.id, action = %event.action, error = %e, "Scheduled event failed");
            }
        }
        self.ctx.save_throttled();
    }

    // =========================================================================
    // Sleep
    // =========================================================================

    fn can_sleep(&self) -> bool {
        self.ctx.lifecycle == LifecycleState::Ready
            && !self.ctx.definition.options.no_sleep
            && self.ctx.backend.driver.supports_sleep()
            && !self.ctx.conns.has_connected()
            && self.active_requests == 0
            && self.raw_streams.is_empty()
    }

    fn reset_sleep_timer(&mut self) {
        self.sleep_deadline = self
            .can_sleep()
            .then(|| Instant::now() + self.ctx.definition.options.sleep_timeout);
    }

    /// Arms the sleep timer if the actor just became eligible. An armed
    /// deadline is never pushed back.
    fn refresh_sleep_timer(&mut self) {
        if !self.can_sleep() {
            self.sleep_deadline = None;
        } else if self.sleep_deadline.is_none() {
            self.reset_sleep_timer();
        }
    }

    fn sleep(&mut self) {
        let actor_id = self.ctx.actor_id();
        match self.ctx.lifecycle {
            LifecycleState::Ready => {}
            LifecycleState::Sleeping => {
                warn!(actor_id = %actor_id, "Actor is already going to sleep");
                return;
            }
            other => {
                debug!(actor_id = %actor_id, lifecycle = ?other, "Ignoring sleep outside ready state");
                return;
            }
        }
        if !self.ctx.backend.driver.supports_sleep() {
            warn!(actor_id = %actor_id, "Driver does not support sleep");
            return;
        }

        info!(actor_id = %actor_id, "Actor going to sleep");
        self.ctx.lifecycle = LifecycleState::Sleeping;
        self.sleep_deadline = None;

        let driver = Arc::clone(&self.ctx.backend.driver);
        let actor_ref = self.ctx.backend.actor_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.sleep(&actor_ref).await {
                error!(actor_id = %actor_ref.actor_id(), error = %e, "Driver failed to put actor to sleep");
            }
        });
    }

    // =========================================================================
    // Stop
    // =========================================================================

    async fn stop(&mut self) {
        let actor_id = self.ctx.actor_id();
        if matches!(
            self.ctx.lifecycle,
            LifecycleState::Stopping | LifecycleState::Stopped
        ) {
            warn!(actor_id = %actor_id, "Actor already stopping");
            return;
        }
        info!(actor_id = %actor_id, "Actor stopping");
        self.ctx.lifecycle = LifecycleState::Stopping;
        self.ctx.abort_tx.send_replace(true);
        let options = self.ctx.definition.options.clone();

        if let Some(hook) = self.ctx.definition.on_stop.clone() {
            let call = AssertUnwindSafe(hook(&mut self.ctx)).catch_unwind();
            match tokio::time::timeout(options.on_stop_timeout, call).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(actor_id = %actor_id, error = %e, "Stop hook failed"),
                Ok(Err(_)) => error!(actor_id = %actor_id, "Stop hook panicked"),
                Err(_) => error!(actor_id = %actor_id, "Stop hook timed out"),
            }
        }

        let closing: Vec<_> = self
            .ctx
            .conns
            .iter()
            .filter(|c| c.status() == ConnStatus::Connected)
            .filter_map(|c| c.sink.as_ref())
            .map(|sink| sink.disconnect(Some("actor stopping".into())))
            .collect();
        let disconnects = tokio::spawn(join_all(closing));

        let background = std::mem::take(&mut self.ctx.background);
        if !background.is_empty()
            && tokio::time::timeout(options.wait_until_timeout, join_all(background))
                .await
                .is_err()
        {
            error!(actor_id = %actor_id, "Timed out waiting for background tasks, they may have leaked");
        }

        self.sleep_deadline = None;
        self.ctx.save_deadline = None;

        if let Err(e) = self.ctx.save_immediate(true).await {
            error!(actor_id = %actor_id, error = %e, "Failed to save state while stopping");
        }

        if tokio::time::timeout(options.disconnect_ceiling, disconnects)
            .await
            .is_err()
        {
            warn!(actor_id = %actor_id, "Timed out waiting for connections to close, shutting down anyway");
        }

        self.ctx.backend.persist_queue.drain().await;
        self.ctx.backend.alarm_queue.drain().await;
        self.ctx.lifecycle = LifecycleState::Stopped;
    }

    fn snapshot(&self) -> Result<InstanceSnapshot, ActorError> {
        let state = serde_json::to_value(&self.ctx.state)
            .map_err(|e| ActorError::Internal(format!("state is not representable as JSON: {e}")))?;
        Ok(InstanceSnapshot {
            actor_id: self.ctx.actor_id(),
            name: self.ctx.name().to_string(),
            key: self.ctx.key().clone(),
            lifecycle: self.ctx.lifecycle,
            state,
            connections: self
                .ctx
                .conns
                .iter()
                .map(|c| ConnSnapshot {
                    id: c.id(),
                    status: c.status(),
                    params: c.params().clone(),
                    state: c.state().cloned(),
                    subscriptions: c.subscriptions().map(str::to_string).collect(),
                    last_seen: c.last_seen(),
                })
                .collect(),
            scheduled: self.ctx.schedule.iter().cloned().collect(),
            dirty: self.ctx.is_dirty(),
        })
    }
}

/// Encodes the record written when an actor is first registered.
pub(crate) fn initial_record(input: Option<serde_json::Value>) -> Result<Bytes, ActorError> {
    let record = PersistedActor::uninitialized(input);
    Ok(Bytes::from(
        persisted_actor_codec().serialize_with_embedded_version(&record)?,
    ))
}
