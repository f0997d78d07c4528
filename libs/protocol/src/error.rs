//! Error types for the record codec and wire encodings.

use thiserror::Error;

/// Errors that can occur while encoding or decoding records and messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input cannot hold the 4-byte version header.
    #[error("data too short to contain a version header ({len} bytes)")]
    TooShort { len: usize },

    /// The embedded version is newer than this build understands.
    #[error("cannot decode data from version {version}, current version is {current}")]
    FutureVersion { version: u32, current: u32 },

    /// No migration is registered for a step between two versions.
    #[error("no migration registered for data at version {version}")]
    MissingMigration { version: u32 },

    /// The payload ended before a field was complete.
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A union or boolean carried a tag this schema does not define.
    #[error("invalid tag {tag} for {context}")]
    InvalidTag { context: &'static str, tag: u8 },

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes were left over after a complete record was decoded.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// A field decoded but failed validation.
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(String),

    /// MessagePack encoding or decoding failed.
    #[error("msgpack error: {0}")]
    MessagePack(String),

    /// A payload of the wrong frame kind was supplied for the encoding.
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(&'static str),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError::MessagePack(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError::MessagePack(err.to_string())
    }
}
