//! # ember-id
//!
//! Identifier types for the ember actor runtime.
//!
//! ## ID Format
//!
//! Runtime-generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `act_01HV4Z2WQXKJNM8GPQY6VBKC3D` (an actor)
//! - `conn_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (a client connection)
//! - `evt_01HV4Z4NYPLTRS0JTUA8XDME5F` (a scheduled event)
//!
//! Prefixes keep IDs of different kinds from being mixed up in logs and on
//! the wire, and ULIDs keep them sortable by creation time.
//!
//! [`ConnToken`] is not an ID: it is the secret a client presents to resume
//! a connection and is never logged.

mod error;
mod macros;
mod token;
mod types;

pub use error::IdError;
pub use token::ConnToken;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

#[doc(hidden)]
pub use macros::parse_prefixed;
