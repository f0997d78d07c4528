//! In-memory driver for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use ember_id::ActorId;
use tracing::debug;

use super::{
    ActorDriver, ActorKey, ActorMetadata, ActorRef, AlarmTimers, ManagerDriver, StorageError,
};
use crate::clock::Clock;

/// Keeps every actor record in process memory.
///
/// Records survive instance sleep and restart but not the process. Write
/// counts and alarm history are recorded for assertions.
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    timers: AlarmTimers,
    supports_sleep: bool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

#[derive(Default)]
struct MemoryState {
    actors: HashMap<ActorId, ActorMetadata>,
    keys: HashMap<(String, ActorKey), ActorId>,
    records: HashMap<ActorId, Bytes>,
    alarms: HashMap<ActorId, u64>,
    alarm_history: Vec<(ActorId, u64)>,
    writes_by_actor: HashMap<ActorId, u64>,
}

impl MemoryDriver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            timers: AlarmTimers::new(clock),
            supports_sleep: true,
            fail_writes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// A driver whose actors never sleep.
    pub fn without_sleep(clock: Arc<dyn Clock>) -> Self {
        Self {
            supports_sleep: false,
            ..Self::new(clock)
        }
    }

    /// Makes every subsequent record write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful record writes for one actor.
    pub fn write_count(&self, actor_id: &ActorId) -> u64 {
        self.lock().writes_by_actor.get(actor_id).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, actor_id: &ActorId) -> Option<Bytes> {
        self.lock().records.get(actor_id).cloned()
    }

    /// Every `set_alarm` call for one actor, oldest first.
    pub fn alarm_history(&self, actor_id: &ActorId) -> Vec<u64> {
        self.lock()
            .alarm_history
            .iter()
            .filter(|(id, _)| id == actor_id)
            .map(|(_, ts)| *ts)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ActorDriver for MemoryDriver {
    async fn read_persisted_data(&self, actor_id: &ActorId) -> Result<Option<Bytes>, StorageError> {
        Ok(self.lock().records.get(actor_id).cloned())
    }

    async fn write_persisted_data(&self, actor_id: &ActorId, data: Bytes) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("memory driver configured to fail".into()));
        }
        let mut state = self.lock();
        state.records.insert(*actor_id, data);
        *state.writes_by_actor.entry(*actor_id).or_default() += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_alarm(&self, actor_ref: &ActorRef, timestamp_ms: u64) -> Result<(), StorageError> {
        {
            let mut state = self.lock();
            state.alarms.insert(actor_ref.actor_id(), timestamp_ms);
            state.alarm_history.push((actor_ref.actor_id(), timestamp_ms));
        }
        let state = Arc::clone(&self.state);
        let actor_id = actor_ref.actor_id();
        self.timers.arm_with(actor_ref, timestamp_ms, move || {
            let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
            if state.alarms.get(&actor_id) == Some(&timestamp_ms) {
                state.alarms.remove(&actor_id);
            }
        });
        Ok(())
    }

    fn supports_sleep(&self) -> bool {
        self.supports_sleep
    }

    async fn sleep(&self, actor_ref: &ActorRef) -> Result<(), StorageError> {
        debug!(actor_id = %actor_ref.actor_id(), "Memory driver putting actor to sleep");
        actor_ref.request_stop();
        Ok(())
    }
}

#[async_trait]
impl ManagerDriver for MemoryDriver {
    async fn get_for_id(&self, actor_id: &ActorId) -> Result<Option<ActorMetadata>, StorageError> {
        Ok(self.lock().actors.get(actor_id).cloned())
    }

    async fn get_for_key(
        &self,
        name: &str,
        key: &ActorKey,
    ) -> Result<Option<ActorMetadata>, StorageError> {
        let state = self.lock();
        Ok(state
            .keys
            .get(&(name.to_string(), key.clone()))
            .and_then(|id| state.actors.get(id))
            .cloned())
    }

    async fn create_actor(&self, metadata: &ActorMetadata, initial: Bytes) -> Result<(), StorageError> {
        let mut state = self.lock();
        let index = (metadata.name.clone(), metadata.key.clone());
        if state.keys.contains_key(&index) || state.actors.contains_key(&metadata.id) {
            return Err(StorageError::AlreadyExists(format!(
                "{} {}",
                metadata.name, metadata.key
            )));
        }
        state.keys.insert(index, metadata.id);
        state.actors.insert(metadata.id, metadata.clone());
        state.records.insert(metadata.id, initial);
        Ok(())
    }

    async fn pending_alarms(&self) -> Result<Vec<(ActorId, u64)>, StorageError> {
        Ok(self.lock().alarms.iter().map(|(id, ts)| (*id, *ts)).collect())
    }
}
