//! Client wire protocol, schema version 1.
//!
//! Inbound ([`ToServer`]) and outbound ([`ToClient`]) frames. With the JSON and
//! MessagePack encodings a frame is `{"tag": "...", "val": {...}}`. With the
//! binary schema encoding a frame is a tag byte followed by the variant's
//! fields, and opaque values (`args`, `output`, `metadata`) are embedded as
//! MessagePack bytes.

use ember_id::{ActorId, ConnId, ConnToken};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bare::{BareReader, BareWriter, SchemaCodec};
use crate::error::CodecError;
use crate::versioned::VersionedCodec;

pub const CLIENT_PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Client -> actor
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "val")]
pub enum ToServer {
    ActionRequest(ActionRequest),
    SubscriptionRequest(SubscriptionRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Caller-chosen id echoed back in the response.
    pub id: u64,
    pub name: String,
    /// Argument list; must be an array.
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub event_name: String,
    pub subscribe: bool,
}

// =============================================================================
// Actor -> client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "val")]
pub enum ToClient {
    Init(Init),
    Error(ErrorFrame),
    ActionResponse(ActionResponse),
    Event(EventFrame),
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Init {
    pub actor_id: ActorId,
    pub connection_id: ConnId,
    pub connection_token: ConnToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Set when the error answers an action request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub id: u64,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub name: String,
    pub args: Value,
}

pub fn to_server_codec() -> VersionedCodec<ToServer> {
    VersionedCodec::new(CLIENT_PROTOCOL_VERSION)
}

pub fn to_client_codec() -> VersionedCodec<ToClient> {
    VersionedCodec::new(CLIENT_PROTOCOL_VERSION)
}

// =============================================================================
// Binary schema
// =============================================================================

fn invalid(field: &'static str, err: impl std::fmt::Display) -> CodecError {
    CodecError::InvalidField {
        field,
        reason: err.to_string(),
    }
}

impl SchemaCodec for ToServer {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError> {
        match self {
            ToServer::ActionRequest(req) => {
                w.put_u8(0);
                w.put_u64(req.id);
                w.put_str(&req.name)?;
                w.put_value(&req.args)
            }
            ToServer::SubscriptionRequest(req) => {
                w.put_u8(1);
                w.put_str(&req.event_name)?;
                w.put_bool(req.subscribe);
                Ok(())
            }
        }
    }

    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError> {
        match r.get_u8()? {
            0 => Ok(ToServer::ActionRequest(ActionRequest {
                id: r.get_u64()?,
                name: r.get_string()?,
                args: r.get_value()?,
            })),
            1 => Ok(ToServer::SubscriptionRequest(SubscriptionRequest {
                event_name: r.get_string()?,
                subscribe: r.get_bool()?,
            })),
            tag => Err(CodecError::InvalidTag {
                context: "ToServer",
                tag,
            }),
        }
    }
}

impl SchemaCodec for ToClient {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError> {
        match self {
            ToClient::Init(init) => {
                w.put_u8(0);
                w.put_str(&init.actor_id.to_string())?;
                w.put_str(&init.connection_id.to_string())?;
                w.put_str(init.connection_token.as_str())
            }
            ToClient::Error(err) => {
                w.put_u8(1);
                w.put_str(&err.code)?;
                w.put_str(&err.message)?;
                w.put_option(err.metadata.as_ref(), BareWriter::put_value)?;
                w.put_option(err.action_id.as_ref(), |w, id| {
                    w.put_u64(*id);
                    Ok(())
                })
            }
            ToClient::ActionResponse(res) => {
                w.put_u8(2);
                w.put_u64(res.id);
                w.put_value(&res.output)
            }
            ToClient::Event(ev) => {
                w.put_u8(3);
                w.put_str(&ev.name)?;
                w.put_value(&ev.args)
            }
        }
    }

    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError> {
        match r.get_u8()? {
            0 => Ok(ToClient::Init(Init {
                actor_id: ActorId::parse(&r.get_string()?).map_err(|e| invalid("actorId", e))?,
                connection_id: ConnId::parse(&r.get_string()?)
                    .map_err(|e| invalid("connectionId", e))?,
                connection_token: ConnToken::parse(&r.get_string()?)
                    .map_err(|e| invalid("connectionToken", e))?,
            })),
            1 => Ok(ToClient::Error(ErrorFrame {
                code: r.get_string()?,
                message: r.get_string()?,
                metadata: r.get_option(BareReader::get_value)?,
                action_id: r.get_option(BareReader::get_u64)?,
            })),
            2 => Ok(ToClient::ActionResponse(ActionResponse {
                id: r.get_u64()?,
                output: r.get_value()?,
            })),
            3 => Ok(ToClient::Event(EventFrame {
                name: r.get_string()?,
                args: r.get_value()?,
            })),
            tag => Err(CodecError::InvalidTag {
                context: "ToClient",
                tag,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_shape_matches_tag_val() {
        let msg = ToServer::ActionRequest(ActionRequest {
            id: 1,
            name: "increment".into(),
            args: json!([5]),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"tag": "ActionRequest", "val": {"id": 1, "name": "increment", "args": [5]}})
        );
    }

    #[test]
    fn test_error_frame_omits_absent_fields() {
        let frame = ToClient::Error(ErrorFrame {
            code: "malformed_message".into(),
            message: "bad".into(),
            metadata: None,
            action_id: None,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["val"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_bare_unknown_tag_is_codec_error() {
        assert!(matches!(
            ToServer::from_bare(&[9]),
            Err(CodecError::InvalidTag {
                context: "ToServer",
                tag: 9
            })
        ));
    }

    #[test]
    fn test_bare_init_carries_identifiers() {
        let init = ToClient::Init(Init {
            actor_id: ActorId::new(),
            connection_id: ConnId::new(),
            connection_token: ConnToken::generate(),
        });
        let bytes = init.to_bare().unwrap();
        assert_eq!(bytes[0], 0);
        assert_eq!(ToClient::from_bare(&bytes).unwrap(), init);
    }
}
