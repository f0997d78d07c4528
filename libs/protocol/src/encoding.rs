//! Per-connection wire encodings.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bare::SchemaCodec;
use crate::client::{to_client_codec, to_server_codec, ToClient, ToServer};
use crate::error::CodecError;
use crate::versioned::VersionedCodec;

/// Encoding negotiated when a connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Human-readable JSON text frames.
    #[default]
    Json,
    /// Compact binary MessagePack frames.
    #[serde(rename = "msgpack")]
    MessagePack,
    /// Versioned binary schema frames.
    Bare,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MessagePack => "msgpack",
            Encoding::Bare => "bare",
        }
    }

    pub fn is_binary(&self) -> bool {
        !matches!(self, Encoding::Json)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            "bare" => Ok(Encoding::Bare),
            other => Err(CodecError::InvalidField {
                field: "encoding",
                reason: format!("unknown encoding '{other}'"),
            }),
        }
    }
}

/// One frame as handed to or received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Text(String),
    Binary(Bytes),
}

impl WirePayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WirePayload::Text(s) => s.as_bytes(),
            WirePayload::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message that can travel over every [`Encoding`].
pub trait WireMessage: Serialize + DeserializeOwned + SchemaCodec {
    fn codec() -> VersionedCodec<Self>;
}

impl WireMessage for ToServer {
    fn codec() -> VersionedCodec<Self> {
        to_server_codec()
    }
}

impl WireMessage for ToClient {
    fn codec() -> VersionedCodec<Self> {
        to_client_codec()
    }
}

pub fn serialize_with_encoding<T: WireMessage>(
    encoding: Encoding,
    value: &T,
) -> Result<WirePayload, CodecError> {
    match encoding {
        Encoding::Json => Ok(WirePayload::Text(serde_json::to_string(value)?)),
        Encoding::MessagePack => Ok(WirePayload::Binary(Bytes::from(
            rmp_serde::to_vec_named(value)?,
        ))),
        Encoding::Bare => Ok(WirePayload::Binary(Bytes::from(
            T::codec().serialize_with_embedded_version(value)?,
        ))),
    }
}

pub fn deserialize_with_encoding<T: WireMessage>(
    encoding: Encoding,
    payload: &WirePayload,
) -> Result<T, CodecError> {
    match (encoding, payload) {
        (Encoding::Json, payload) => Ok(serde_json::from_slice(payload.as_bytes())?),
        (_, WirePayload::Text(_)) => Err(CodecError::UnsupportedPayload(
            "text frame on a binary encoding",
        )),
        (Encoding::MessagePack, WirePayload::Binary(bytes)) => Ok(rmp_serde::from_slice(bytes)?),
        (Encoding::Bare, WirePayload::Binary(bytes)) => {
            T::codec().deserialize_with_embedded_version(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ActionRequest, ActionResponse};
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::json(Encoding::Json)]
    #[case::msgpack(Encoding::MessagePack)]
    #[case::bare(Encoding::Bare)]
    fn test_action_request_over_each_encoding(#[case] encoding: Encoding) {
        let msg = ToServer::ActionRequest(ActionRequest {
            id: 42,
            name: "increment".into(),
            args: json!([5, {"nested": true}]),
        });
        let payload = serialize_with_encoding(encoding, &msg).unwrap();
        assert_eq!(matches!(payload, WirePayload::Binary(_)), encoding.is_binary());
        let decoded: ToServer = deserialize_with_encoding(encoding, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_bare_payload_has_version_header() {
        let msg = ToClient::ActionResponse(ActionResponse {
            id: 1,
            output: json!(5),
        });
        let payload = serialize_with_encoding(Encoding::Bare, &msg).unwrap();
        assert_eq!(&payload.as_bytes()[..4], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_text_on_binary_encoding_rejected() {
        let payload = WirePayload::Text("{}".into());
        let result: Result<ToServer, _> = deserialize_with_encoding(Encoding::Bare, &payload);
        assert!(matches!(result, Err(CodecError::UnsupportedPayload(_))));
    }

    #[test]
    fn test_json_accepts_binary_frames() {
        let payload = WirePayload::Binary(Bytes::from_static(
            br#"{"tag":"SubscriptionRequest","val":{"eventName":"chat","subscribe":true}}"#,
        ));
        let decoded: ToServer = deserialize_with_encoding(Encoding::Json, &payload).unwrap();
        assert!(matches!(decoded, ToServer::SubscriptionRequest(_)));
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("msgpack".parse::<Encoding>().unwrap(), Encoding::MessagePack);
        assert_eq!(Encoding::Bare.to_string(), "bare");
        assert!("cbor".parse::<Encoding>().is_err());
        assert_eq!(
            serde_json::to_string(&Encoding::MessagePack).unwrap(),
            "\"msgpack\""
        );
    }
}
