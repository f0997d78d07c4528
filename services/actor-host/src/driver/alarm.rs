//! In-process alarm timers shared by the bundled drivers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_id::ActorId;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ActorRef;
use crate::clock::Clock;

/// One tokio timer per actor; arming replaces the previous timer.
pub struct AlarmTimers {
    clock: Arc<dyn Clock>,
    timers: Mutex<HashMap<ActorId, JoinHandle<()>>>,
}

impl AlarmTimers {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn arm(&self, actor_ref: &ActorRef, timestamp_ms: u64) {
        self.arm_with(actor_ref, timestamp_ms, || {});
    }

    /// Like [`arm`](Self::arm), running `on_fire` just before the wake is
    /// routed. Drivers use it to drop their bookkeeping for the alarm.
    pub fn arm_with<F>(&self, actor_ref: &ActorRef, timestamp_ms: u64, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = Duration::from_millis(timestamp_ms.saturating_sub(self.clock.now_ms()));
        let target = actor_ref.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
            target.fire_alarm();
        });

        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.retain(|_, h| !h.is_finished());
        if let Some(previous) = timers.insert(actor_ref.actor_id(), handle) {
            previous.abort();
        }
        debug!(
            actor_id = %actor_ref.actor_id(),
            delay_ms = delay.as_millis() as u64,
            "Alarm armed"
        );
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for AlarmTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
