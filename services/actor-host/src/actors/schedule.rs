//! Durable scheduled actions.
//!
//! Events are kept sorted by timestamp, ties in insertion order. Only the
//! head is backed by a driver alarm; when it fires every due event runs and
//! the alarm is re-armed for the next head before those events execute.

use std::time::Duration;

use ember_id::ScheduledEventId;
use ember_protocol::{PersistedScheduleEvent, ScheduleEventKind};
use serde::Serialize;
use serde_json::Value;

use super::context::{ActorContext, ActorState};
use super::errors::ActorError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledEvent {
    pub id: ScheduledEventId,
    pub timestamp: u64,
    pub action: String,
    pub args: Vec<Value>,
}

impl ScheduledEvent {
    fn to_persisted(&self) -> PersistedScheduleEvent {
        PersistedScheduleEvent {
            event_id: self.id,
            timestamp: self.timestamp,
            kind: ScheduleEventKind::Generic {
                action: self.action.clone(),
                args: Some(Value::Array(self.args.clone())),
            },
        }
    }

    fn from_persisted(persisted: PersistedScheduleEvent) -> Self {
        let ScheduleEventKind::Generic { action, args } = persisted.kind;
        let args = match args {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args,
            Some(other) => vec![other],
        };
        Self {
            id: persisted.event_id,
            timestamp: persisted.timestamp,
            action,
            args,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: Vec<ScheduledEvent>,
}

impl EventQueue {
    pub fn restore(persisted: Vec<PersistedScheduleEvent>) -> Self {
        let mut queue = Self::default();
        for event in persisted {
            queue.insert(ScheduledEvent::from_persisted(event));
        }
        queue
    }

    /// Inserts before the first strictly later event. Returns true if the
    /// event became the new head.
    pub fn insert(&mut self, event: ScheduledEvent) -> bool {
        let index = self
            .events
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(index, event);
        index == 0
    }

    /// Removes and returns every event due at `now_ms`, in order.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<ScheduledEvent> {
        let due = self.events.partition_point(|e| e.timestamp <= now_ms);
        self.events.drain(..due).collect()
    }

    /// Returns the removed event and whether it was the head.
    pub fn remove(&mut self, id: &ScheduledEventId) -> Option<(ScheduledEvent, bool)> {
        let index = self.events.iter().position(|e| &e.id == id)?;
        Some((self.events.remove(index), index == 0))
    }

    pub fn head(&self) -> Option<&ScheduledEvent> {
        self.events.first()
    }

    pub fn get(&self, id: &ScheduledEventId) -> Option<&ScheduledEvent> {
        self.events.iter().find(|e| &e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduledEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn to_persisted(&self) -> Vec<PersistedScheduleEvent> {
        self.events.iter().map(ScheduledEvent::to_persisted).collect()
    }
}

/// Scheduling API handed out by [`ActorContext::schedule`].
pub struct Schedule<'a, S: ActorState> {
    ctx: &'a mut ActorContext<S>,
}

impl<'a, S: ActorState> Schedule<'a, S> {
    pub(crate) fn new(ctx: &'a mut ActorContext<S>) -> Self {
        Self { ctx }
    }

    /// Runs `action` once `delay` has elapsed.
    pub async fn after(
        self,
        delay: Duration,
        action: &str,
        args: Vec<Value>,
    ) -> Result<ScheduledEventId, ActorError> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let timestamp = self.ctx.now_ms().saturating_add(delay_ms);
        self.at(timestamp, action, args).await
    }

    /// Runs `action` at `timestamp_ms` (Unix milliseconds). Past timestamps
    /// run on the next alarm.
    pub async fn at(
        self,
        timestamp_ms: u64,
        action: &str,
        args: Vec<Value>,
    ) -> Result<ScheduledEventId, ActorError> {
        if !self.ctx.definition.has_action(action) {
            return Err(ActorError::ActionNotFound(action.to_string()));
        }

        let event = ScheduledEvent {
            id: ScheduledEventId::new(),
            timestamp: timestamp_ms,
            action: action.to_string(),
            args,
        };
        let id = event.id;
        let is_head = self.ctx.schedule.insert(event);
        tracing::debug!(
            actor_id = %self.ctx.actor_id(),
            event_id = %id,
            timestamp_ms,
            action,
            "Scheduled event"
        );

        self.ctx.mark_dirty();
        self.ctx.save_immediate(false).await?;
        if is_head {
            self.ctx.arm_alarm(timestamp_ms).await?;
        }
        Ok(id)
    }

    pub fn get(&self, id: &ScheduledEventId) -> Option<&ScheduledEvent> {
        self.ctx.schedule.get(id)
    }

    pub fn list(&self) -> Vec<ScheduledEvent> {
        self.ctx.schedule.iter().cloned().collect()
    }

    /// Returns false if no such event is pending.
    pub async fn cancel(self, id: &ScheduledEventId) -> Result<bool, ActorError> {
        let Some((_, was_head)) = self.ctx.schedule.remove(id) else {
            return Ok(false);
        };

        self.ctx.mark_dirty();
        self.ctx.save_immediate(false).await?;
        if was_head {
            if let Some(next) = self.ctx.schedule.head().map(|e| e.timestamp) {
                self.ctx.arm_alarm(next).await?;
            }
        }
        Ok(true)
    }
}
