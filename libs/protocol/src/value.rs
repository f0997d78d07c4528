//! MessagePack helpers for opaque values and typed actor state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CodecError;

pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encodes a typed value with struct fields as named map entries, so
/// adding a defaulted field does not invalidate stored data.
pub fn encode_typed<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_typed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct V1 {
        count: i64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct V2 {
        count: i64,
        #[serde(default)]
        label: String,
    }

    #[test]
    fn test_defaulted_field_reads_older_bytes() {
        let bytes = encode_typed(&V1 { count: 3 }).unwrap();
        let upgraded: V2 = decode_typed(&bytes).unwrap();
        assert_eq!(
            upgraded,
            V2 {
                count: 3,
                label: String::new()
            }
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(
            decode_typed::<V1>(&[0xc1]),
            Err(CodecError::MessagePack(_))
        ));
    }
}
