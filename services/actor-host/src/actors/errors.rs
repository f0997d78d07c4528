//! Errors that can reach an actor's callers.

use ember_id::ConnId;
use ember_protocol::{CodecError, ErrorFrame};
use serde_json::Value;
use thiserror::Error;

use crate::driver::StorageError;

const INTERNAL_ERROR_CODE: &str = "internal_error";
const INTERNAL_ERROR_MESSAGE: &str = "Internal error. Read the actor logs for more details.";

/// Errors surfaced by actor instances and the manager.
///
/// Every variant has a stable [`code`](ActorError::code). Only public
/// variants reveal their message to clients; everything else is reported as
/// `internal_error` and logged in full.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActorError {
    #[error("action '{0}' not found")]
    ActionNotFound(String),

    #[error("action timed out")]
    ActionTimedOut,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message too long: {size} bytes exceeds the {max} byte limit")]
    MessageTooLong { size: usize, max: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("state is not serializable at '{path}': {reason}")]
    InvalidStateType { path: String, reason: String },

    #[error("actor is not ready")]
    NotReady,

    #[error("actor is stopping")]
    Stopping,

    #[error("connection {0} already exists")]
    ConnExists(ConnId),

    #[error("connection {0} not found")]
    ConnNotFound(ConnId),

    #[error("incorrect connection token")]
    IncorrectConnToken,

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("actor already exists: {0}")]
    ActorAlreadyExists(String),

    #[error("no actor definition named '{0}'")]
    UnknownDefinition(String),

    /// Raised by actor code with its own code and metadata.
    #[error("{message}")]
    User {
        code: String,
        message: String,
        metadata: Option<Value>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ActorError {
    fn from(err: anyhow::Error) -> Self {
        ActorError::Internal(format!("{err:#}"))
    }
}

impl ActorError {
    /// A public error raised by actor code.
    pub fn user(code: impl Into<String>, message: impl Into<String>) -> Self {
        ActorError::User {
            code: code.into(),
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(self, metadata: Value) -> Self {
        match self {
            ActorError::User { code, message, .. } => ActorError::User {
                code,
                message,
                metadata: Some(metadata),
            },
            other => other,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ActorError::ActionNotFound(_) => "action_not_found",
            ActorError::ActionTimedOut => "action_timed_out",
            ActorError::MalformedMessage(_) => "malformed_message",
            ActorError::MessageTooLong { .. } => "message_too_long",
            ActorError::Unsupported(_) => "unsupported",
            ActorError::InvalidStateType { .. } => "invalid_state_type",
            ActorError::NotReady => "actor_not_ready",
            ActorError::Stopping => "actor_stopping",
            ActorError::ConnExists(_) => "connection_exists",
            ActorError::ConnNotFound(_) => "connection_not_found",
            ActorError::IncorrectConnToken => "incorrect_connection_token",
            ActorError::ActorNotFound(_) => "actor_not_found",
            ActorError::ActorAlreadyExists(_) => "actor_already_exists",
            ActorError::UnknownDefinition(_) => "unknown_definition",
            ActorError::User { code, .. } => code,
            ActorError::Storage(_)
            | ActorError::Codec(_)
            | ActorError::MailboxFull
            | ActorError::ActorStopped
            | ActorError::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Whether the message may be shown to clients.
    pub fn is_public(&self) -> bool {
        !matches!(
            self,
            ActorError::Storage(_)
                | ActorError::Codec(_)
                | ActorError::MailboxFull
                | ActorError::ActorStopped
                | ActorError::Internal(_)
        )
    }

    /// The instance is going away; the call may succeed on a fresh instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActorError::Stopping | ActorError::ActorStopped)
    }

    pub fn to_error_frame(&self, action_id: Option<u64>) -> ErrorFrame {
        if !self.is_public() {
            return ErrorFrame {
                code: INTERNAL_ERROR_CODE.to_string(),
                message: INTERNAL_ERROR_MESSAGE.to_string(),
                metadata: None,
                action_id,
            };
        }

        let metadata = match self {
            ActorError::User { metadata, .. } => metadata.clone(),
            ActorError::MessageTooLong { size, max } => {
                Some(serde_json::json!({ "size": size, "max": max }))
            }
            ActorError::InvalidStateType { path, .. } => Some(serde_json::json!({ "path": path })),
            _ => None,
        };

        ErrorFrame {
            code: self.code().to_string(),
            message: self.to_string(),
            metadata,
            action_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_internal_errors_are_masked() {
        let err = ActorError::Storage(StorageError::Backend("disk on fire".into()));
        let frame = err.to_error_frame(Some(3));
        assert_eq!(frame.code, "internal_error");
        assert!(!frame.message.contains("disk"));
        assert_eq!(frame.action_id, Some(3));
    }

    #[test]
    fn test_user_error_keeps_code_and_metadata() {
        let err = ActorError::user("insufficient_funds", "balance too low")
            .with_metadata(json!({"balance": 3}));
        let frame = err.to_error_frame(None);
        assert_eq!(frame.code, "insufficient_funds");
        assert_eq!(frame.message, "balance too low");
        assert_eq!(frame.metadata, Some(json!({"balance": 3})));
    }

    #[test]
    fn test_public_codes() {
        assert_eq!(ActorError::ActionNotFound("x".into()).code(), "action_not_found");
        assert_eq!(ActorError::ActionTimedOut.code(), "action_timed_out");
        assert_eq!(
            ActorError::MessageTooLong { size: 10, max: 5 }.code(),
            "message_too_long"
        );
        assert!(ActorError::MalformedMessage("x".into()).is_public());
    }

    #[test]
    fn test_anyhow_becomes_internal() {
        let err: ActorError = anyhow::anyhow!("hook exploded").into();
        assert_eq!(err.code(), "internal_error");
        assert!(!err.is_public());
    }

    #[test]
    fn test_retryable() {
        assert!(ActorError::Stopping.is_retryable());
        assert!(ActorError::ActorStopped.is_retryable());
        assert!(!ActorError::NotReady.is_retryable());
    }
}
