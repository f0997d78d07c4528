//! ember actor host library
//!
//! Hosts durable stateful actors: each actor owns a piece of state that is
//! persisted through a storage driver, serves actions and client connections
//! one message at a time, and fires scheduled events through a per-actor
//! alarm.
//!
//! ## Architecture
//!
//! ```text
//! ActorManager
//! ├── wake loop               (driver alarms, sleep requests)
//! └── ActorInstance(id)       (one task per live actor)
//!     ├── ConnectionManager   (clients, subscriptions, liveness)
//!     ├── EventQueue          (durable schedule)
//!     └── WriteQueue          (single-flight record writes)
//! ```
//!
//! ## Modules
//!
//! - `actors`: definitions, instances, and the manager
//! - `driver`: storage contracts plus in-memory and SQLite drivers
//! - `write_queue`: single-flight coalescing write queue
//! - `tcp`: line-delimited JSON transport used by the binary

pub mod actors;
pub mod clock;
pub mod config;
pub mod demo;
pub mod driver;
pub mod tcp;
pub mod write_queue;

// Re-export commonly used types
pub use actors::{
    ActorContext, ActorDefinition, ActorError, ActorManager, ActorQuery, ConnectRequest,
};
pub use config::{HostConfig, InstanceOptions};
pub use driver::{ActorKey, MemoryDriver, SqliteDriver};
