//! # ember-protocol
//!
//! Durable record codec and client wire protocol for the ember actor runtime.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ encoding   Json | MessagePack | Bare          │  per connection
//! ├──────────────────────────────────────────────┤
//! │ versioned  [u32 LE version][schema payload]   │  migrations
//! ├──────────────────────────────────────────────┤
//! │ bare       fixed-width LE ints, u32-prefixed  │
//! │            strings/bytes, tagged unions       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The same versioned mechanism covers persisted actor snapshots
//! ([`PersistedActor`]) and every client message ([`ToServer`], [`ToClient`]).
//!
//! Opaque application values (action arguments, connection parameters,
//! connection state) are `serde_json::Value` in memory and MessagePack bytes
//! inside the binary schema.

mod bare;
mod client;
mod encoding;
mod error;
mod persist;
mod value;
mod versioned;

pub use bare::{BareReader, BareWriter, SchemaCodec};
pub use client::*;
pub use encoding::{deserialize_with_encoding, serialize_with_encoding, Encoding, WireMessage, WirePayload};
pub use error::CodecError;
pub use persist::*;
pub use value::{decode_typed, decode_value, encode_typed, encode_value};
pub use versioned::{Migration, VersionedCodec};
