//! Storage driver contracts.
//!
//! The actor instance consumes [`ActorDriver`]: one opaque blob per actor,
//! one alarm per actor, and an optional sleep hook. The manager consumes
//! [`ManagerDriver`] to resolve keys to ids and to create actors.
//!
//! Drivers never call into an instance directly. Alarms and sleep requests
//! travel back through an [`ActorRef`] to the manager, which starts or stops
//! the instance as needed.

mod alarm;
mod memory;
mod sqlite;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ember_id::ActorId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub use alarm::AlarmTimers;
pub use memory::MemoryDriver;
pub use sqlite::SqliteDriver;

/// Errors from storage operations.
///
/// `Clone` so one failed write can be reported to every caller that joined
/// the write cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("actor not found: {0}")]
    NotFound(String),

    #[error("actor already exists: {0}")]
    AlreadyExists(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Opaque per-actor database handle returned by [`ActorDriver::get_database`].
///
/// Callers downcast to the concrete type their driver documents.
pub type DatabaseHandle = Arc<dyn Any + Send + Sync>;

/// User-chosen address of an actor within its definition name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorKey(pub Vec<String>);

impl ActorKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for ActorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Identity of an actor, held by the manager driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorMetadata {
    pub id: ActorId,
    pub name: String,
    pub key: ActorKey,
}

// =============================================================================
// Wake routing
// =============================================================================

/// Signal sent from a driver back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeSignal {
    /// The actor's alarm is due; start it if needed and deliver the alarm.
    Alarm(ActorId),
    /// The actor asked to sleep; stop it gracefully.
    Sleep(ActorId),
}

/// Cheap, cloneable reference a driver uses to reach an actor.
#[derive(Debug, Clone)]
pub struct ActorRef {
    actor_id: ActorId,
    wake_tx: mpsc::UnboundedSender<WakeSignal>,
}

impl ActorRef {
    pub fn new(actor_id: ActorId, wake_tx: mpsc::UnboundedSender<WakeSignal>) -> Self {
        Self { actor_id, wake_tx }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn fire_alarm(&self) {
        if self.wake_tx.send(WakeSignal::Alarm(self.actor_id)).is_err() {
            debug!(actor_id = %self.actor_id, "Alarm fired after manager shut down");
        }
    }

    pub fn request_stop(&self) {
        if self.wake_tx.send(WakeSignal::Sleep(self.actor_id)).is_err() {
            debug!(actor_id = %self.actor_id, "Sleep requested after manager shut down");
        }
    }
}

// =============================================================================
// Contracts
// =============================================================================

#[async_trait]
pub trait ActorDriver: Send + Sync + 'static {
    async fn read_persisted_data(&self, actor_id: &ActorId) -> Result<Option<Bytes>, StorageError>;

    async fn write_persisted_data(&self, actor_id: &ActorId, data: Bytes)
        -> Result<(), StorageError>;

    /// Arms the actor's single alarm, replacing any earlier one.
    async fn set_alarm(&self, actor_ref: &ActorRef, timestamp_ms: u64) -> Result<(), StorageError>;

    fn supports_sleep(&self) -> bool {
        false
    }

    /// Asks the host to stop the actor so it can be evicted from memory.
    async fn sleep(&self, _actor_ref: &ActorRef) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_database(&self, _actor_id: &ActorId) -> Result<Option<DatabaseHandle>, StorageError> {
        Ok(None)
    }
}

#[async_trait]
pub trait ManagerDriver: Send + Sync + 'static {
    async fn get_for_id(&self, actor_id: &ActorId) -> Result<Option<ActorMetadata>, StorageError>;

    async fn get_for_key(&self, name: &str, key: &ActorKey)
        -> Result<Option<ActorMetadata>, StorageError>;

    /// Registers a new actor and stores its initial record in one step.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if `(name, key)` is taken.
    async fn create_actor(&self, metadata: &ActorMetadata, initial: Bytes)
        -> Result<(), StorageError>;

    /// Alarms that were armed when the host last ran.
    async fn pending_alarms(&self) -> Result<Vec<(ActorId, u64)>, StorageError>;
}

/// A driver that serves both the instances and the manager.
pub trait Driver: ActorDriver + ManagerDriver {}

impl<T: ActorDriver + ManagerDriver> Driver for T {}
