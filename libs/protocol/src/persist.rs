//! Persisted actor record, schema version 1.
//!
//! Layout (all fields in order):
//!
//! ```text
//! PersistedActor   input: option<value>, has_initialized: bool,
//!                  state: option<bytes>, connections: list<PersistedConn>,
//!                  scheduled_events: list<PersistedScheduleEvent>
//! PersistedConn    id: str, token: str, driver: str, driver_state: value,
//!                  parameters: value, state: option<value>, auth: option<value>,
//!                  subscriptions: list<str>, last_seen: u64
//! ScheduleEvent    event_id: str, timestamp: u64, kind: union { 0 => Generic }
//! Generic          action: str, args: option<value>
//! ```

use ember_id::{ConnId, ConnToken, ScheduledEventId};
use serde_json::Value;

use crate::bare::{BareReader, BareWriter, SchemaCodec};
use crate::error::CodecError;
use crate::versioned::VersionedCodec;

pub const PERSISTED_ACTOR_VERSION: u32 = 1;

/// Codec for [`PersistedActor`] snapshots.
pub fn persisted_actor_codec() -> VersionedCodec<PersistedActor> {
    VersionedCodec::new(PERSISTED_ACTOR_VERSION)
}

/// Durable snapshot of one actor.
///
/// `state` holds the actor's domain state as MessagePack bytes. It is `None`
/// exactly while `has_initialized` is false.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistedActor {
    pub input: Option<Value>,
    pub has_initialized: bool,
    pub state: Option<Vec<u8>>,
    pub connections: Vec<PersistedConn>,
    pub scheduled_events: Vec<PersistedScheduleEvent>,
}

impl PersistedActor {
    /// The record written when an actor is created, before its first start.
    pub fn uninitialized(input: Option<Value>) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedConn {
    pub id: ConnId,
    pub token: ConnToken,
    /// Transport that created the connection.
    pub driver: String,
    pub driver_state: Value,
    pub parameters: Value,
    pub state: Option<Value>,
    pub auth: Option<Value>,
    pub subscriptions: Vec<String>,
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedScheduleEvent {
    pub event_id: ScheduledEventId,
    pub timestamp: u64,
    pub kind: ScheduleEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleEventKind {
    /// Invoke a named action with an optional argument list.
    Generic { action: String, args: Option<Value> },
}

impl SchemaCodec for PersistedActor {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError> {
        w.put_option(self.input.as_ref(), BareWriter::put_value)?;
        w.put_bool(self.has_initialized);
        w.put_option(self.state.as_deref(), BareWriter::put_bytes)?;
        w.put_list(&self.connections, |w, c| c.encode(w))?;
        w.put_list(&self.scheduled_events, |w, e| e.encode(w))
    }

    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError> {
        let input = r.get_option(BareReader::get_value)?;
        let has_initialized = r.get_bool()?;
        let state = r.get_option(|r| r.get_bytes().map(<[u8]>::to_vec))?;
        if !has_initialized && state.is_some() {
            return Err(CodecError::InvalidField {
                field: "state",
                reason: "present on an actor that has not initialized".into(),
            });
        }
        Ok(Self {
            input,
            has_initialized,
            state,
            connections: r.get_list(PersistedConn::decode)?,
            scheduled_events: r.get_list(PersistedScheduleEvent::decode)?,
        })
    }
}

impl SchemaCodec for PersistedConn {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError> {
        w.put_str(&self.id.to_string())?;
        w.put_str(self.token.as_str())?;
        w.put_str(&self.driver)?;
        w.put_value(&self.driver_state)?;
        w.put_value(&self.parameters)?;
        w.put_option(self.state.as_ref(), BareWriter::put_value)?;
        w.put_option(self.auth.as_ref(), BareWriter::put_value)?;
        w.put_list(&self.subscriptions, |w, s| w.put_str(s))?;
        w.put_u64(self.last_seen);
        Ok(())
    }

    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError> {
        let id = r.get_string()?;
        let id = ConnId::parse(&id).map_err(|e| CodecError::InvalidField {
            field: "connection.id",
            reason: e.to_string(),
        })?;
        let token = ConnToken::parse(&r.get_string()?).map_err(|e| CodecError::InvalidField {
            field: "connection.token",
            reason: e.to_string(),
        })?;
        Ok(Self {
            id,
            token,
            driver: r.get_string()?,
            driver_state: r.get_value()?,
            parameters: r.get_value()?,
            state: r.get_option(BareReader::get_value)?,
            auth: r.get_option(BareReader::get_value)?,
            subscriptions: r.get_list(BareReader::get_string)?,
            last_seen: r.get_u64()?,
        })
    }
}

impl SchemaCodec for PersistedScheduleEvent {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError> {
        w.put_str(&self.event_id.to_string())?;
        w.put_u64(self.timestamp);
        match &self.kind {
            ScheduleEventKind::Generic { action, args } => {
                w.put_u8(0);
                w.put_str(action)?;
                w.put_option(args.as_ref(), BareWriter::put_value)
            }
        }
    }

    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError> {
        let event_id =
            ScheduledEventId::parse(&r.get_string()?).map_err(|e| CodecError::InvalidField {
                field: "scheduled_event.event_id",
                reason: e.to_string(),
            })?;
        let timestamp = r.get_u64()?;
        let kind = match r.get_u8()? {
            0 => ScheduleEventKind::Generic {
                action: r.get_string()?,
                args: r.get_option(BareReader::get_value)?,
            },
            tag => {
                return Err(CodecError::InvalidTag {
                    context: "schedule event kind",
                    tag,
                })
            }
        };
        Ok(Self {
            event_id,
            timestamp,
            kind,
        })
    }
}
