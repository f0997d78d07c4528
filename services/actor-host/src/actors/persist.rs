//! Saving actor records and arming alarms.
//!
//! Mutations only raise a dirty flag. Saves are throttled to one per
//! `state_save_interval` unless a caller needs durability now. All record
//! writes for an actor go through its persist queue, so at most one write is
//! in flight and the latest snapshot wins.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_protocol::{encode_typed, persisted_actor_codec, PersistedActor};
use tracing::{debug, error};

use super::context::{ActorContext, ActorState, LifecycleState};
use super::errors::ActorError;
use crate::write_queue::WriteTicket;

impl<S: ActorState> ActorContext<S> {
    pub(crate) fn mark_dirty(&self) {
        self.backend.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> Result<PersistedActor, ActorError> {
        Ok(PersistedActor {
            input: self.input.clone(),
            has_initialized: true,
            state: Some(encode_typed(&self.state)?),
            connections: self.conns.to_persisted(),
            scheduled_events: self.schedule.to_persisted(),
        })
    }

    pub(crate) fn encode_record(&self) -> Result<Bytes, ActorError> {
        let record = self.snapshot()?;
        Ok(Bytes::from(
            persisted_actor_codec().serialize_with_embedded_version(&record)?,
        ))
    }

    /// Enqueues a write of the current snapshot if anything changed.
    ///
    /// The snapshot is taken now, not when the queue gets to it. A failed
    /// write raises the dirty flag again so the next save retries it.
    pub(crate) fn start_save(&mut self) -> Result<Option<WriteTicket>, ActorError> {
        self.save_deadline = None;
        if !self.backend.dirty.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }

        let data = match self.encode_record() {
            Ok(data) => data,
            Err(e) => {
                self.mark_dirty();
                return Err(e);
            }
        };
        self.last_save_ms = self.now_ms();

        let driver = Arc::clone(&self.backend.driver);
        let dirty = Arc::clone(&self.backend.dirty);
        let actor_id = self.actor_id();
        debug!(actor_id = %actor_id, bytes = data.len(), "Saving actor record");

        let ticket = self.backend.persist_queue.enqueue(Box::pin(async move {
            let result = driver.write_persisted_data(&actor_id, data).await;
            if result.is_err() {
                dirty.store(true, Ordering::SeqCst);
            }
            result
        }));
        Ok(Some(ticket))
    }

    /// Saves now if the interval has passed, otherwise sets a deadline for
    /// the instance loop to flush at.
    pub(crate) fn save_throttled(&mut self) {
        if !self.is_dirty() {
            return;
        }

        let interval_ms = u64::try_from(self.definition.options.state_save_interval.as_millis())
            .unwrap_or(u64::MAX);
        let since_last = self.now_ms().saturating_sub(self.last_save_ms);

        if since_last >= interval_ms {
            if let Err(e) = self.start_save() {
                error!(actor_id = %self.actor_id(), error = %e, "Failed to save actor record");
            }
        } else if self.save_deadline.is_none() {
            let wait = Duration::from_millis(interval_ms - since_last);
            self.save_deadline = Some(tokio::time::Instant::now() + wait);
        }
    }

    /// Writes the current snapshot and waits until it is durable.
    ///
    /// Outside of stop, callers are refused once the actor is stopping.
    pub(crate) async fn save_immediate(&mut self, allow_stopping: bool) -> Result<(), ActorError> {
        if !allow_stopping
            && matches!(
                self.lifecycle,
                LifecycleState::Stopping | LifecycleState::Stopped
            )
        {
            return Err(ActorError::Stopping);
        }

        match self.start_save()? {
            Some(ticket) => ticket.wait().await?,
            None => self.backend.persist_queue.drain().await,
        }
        Ok(())
    }

    /// Asks the driver to wake this actor at `timestamp_ms`.
    pub(crate) async fn arm_alarm(&self, timestamp_ms: u64) -> Result<(), ActorError> {
        let driver = Arc::clone(&self.backend.driver);
        let actor_ref = self.backend.actor_ref.clone();
        let ticket = self.backend.alarm_queue.enqueue(Box::pin(async move {
            driver.set_alarm(&actor_ref, timestamp_ms).await
        }));
        ticket.wait().await?;
        Ok(())
    }
}
