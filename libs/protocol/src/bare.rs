//! Binary schema primitives.
//!
//! Numbers are fixed-width little-endian. Strings, byte fields and list
//! lengths carry a `u32` little-endian length prefix. Optional fields and
//! unions are introduced by a single tag byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::CodecError;
use crate::value::{decode_value, encode_value};

/// A type with a fixed binary layout.
pub trait SchemaCodec: Sized {
    fn encode(&self, w: &mut BareWriter) -> Result<(), CodecError>;
    fn decode(r: &mut BareReader<'_>) -> Result<Self, CodecError>;

    /// Encodes into a fresh buffer.
    fn to_bare(&self) -> Result<Bytes, CodecError> {
        let mut w = BareWriter::new();
        self.encode(&mut w)?;
        Ok(w.finish())
    }

    /// Decodes a complete buffer, rejecting trailing bytes.
    fn from_bare(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = BareReader::new(bytes);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

#[derive(Debug, Default)]
pub struct BareWriter {
    buf: BytesMut,
}

impl BareWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.put_len(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    pub fn put_str(&mut self, v: &str) -> Result<(), CodecError> {
        self.put_bytes(v.as_bytes())
    }

    /// Writes an opaque value as MessagePack bytes.
    pub fn put_value(&mut self, v: &Value) -> Result<(), CodecError> {
        let encoded = encode_value(v)?;
        self.put_bytes(&encoded)
    }

    pub fn put_option<T>(
        &mut self,
        v: Option<&T>,
        f: impl FnOnce(&mut Self, &T) -> Result<(), CodecError>,
    ) -> Result<(), CodecError>
    where
        T: ?Sized,
    {
        match v {
            Some(inner) => {
                self.put_u8(1);
                f(self, inner)
            }
            None => {
                self.put_u8(0);
                Ok(())
            }
        }
    }

    pub fn put_list<T>(
        &mut self,
        items: &[T],
        mut f: impl FnMut(&mut Self, &T) -> Result<(), CodecError>,
    ) -> Result<(), CodecError> {
        self.put_len(items.len())?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn put_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::InvalidField {
            field: "length",
            reason: format!("{len} exceeds u32::MAX"),
        })?;
        self.put_u32(len);
        Ok(())
    }
}

#[derive(Debug)]
pub struct BareReader<'a> {
    buf: &'a [u8],
}

impl<'a> BareReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag {
                context: "bool",
                tag,
            }),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let raw = self.get_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn get_value(&mut self) -> Result<Value, CodecError> {
        let raw = self.get_bytes()?;
        decode_value(raw)
    }

    pub fn get_option<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => f(self).map(Some),
            tag => Err(CodecError::InvalidTag {
                context: "optional",
                tag,
            }),
        }
    }

    pub fn get_list<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Vec<T>, CodecError> {
        let len = self.get_u32()? as usize;
        // Every element occupies at least one byte.
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }

    fn need(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.len() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_width_little_endian() {
        let mut w = BareWriter::new();
        w.put_u32(0x0102_0304);
        w.put_u64(1);
        let bytes = w.finish();
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut w = BareWriter::new();
        w.put_str("hey").unwrap();
        assert_eq!(&w.finish()[..], &[3, 0, 0, 0, b'h', b'e', b'y']);
    }

    #[test]
    fn test_reader_reports_eof() {
        let mut r = BareReader::new(&[5, 0, 0, 0, b'a']);
        let err = r.get_string().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEof {
                needed: 5,
                remaining: 1
            }
        );
    }

    #[test]
    fn test_invalid_bool_tag() {
        let mut r = BareReader::new(&[7]);
        assert!(matches!(
            r.get_bool(),
            Err(CodecError::InvalidTag { context: "bool", tag: 7 })
        ));
    }

    #[test]
    fn test_option_and_list() {
        let mut w = BareWriter::new();
        w.put_option(Some("x"), |w, s| w.put_str(s)).unwrap();
        w.put_option(None::<&str>, |w, s| w.put_str(s)).unwrap();
        w.put_list(&[1u64, 2, 3], |w, v| {
            w.put_u64(*v);
            Ok(())
        })
        .unwrap();
        let bytes = w.finish();

        let mut r = BareReader::new(&bytes);
        assert_eq!(r.get_option(|r| r.get_string()).unwrap(), Some("x".into()));
        assert_eq!(r.get_option(|r| r.get_string()).unwrap(), None);
        assert_eq!(r.get_list(|r| r.get_u64()).unwrap(), vec![1, 2, 3]);
        r.finish().unwrap();
    }

    #[test]
    fn test_value_field() {
        let mut w = BareWriter::new();
        w.put_value(&json!({"a": [1, "two", null]})).unwrap();
        let bytes = w.finish();
        let mut r = BareReader::new(&bytes);
        assert_eq!(r.get_value().unwrap(), json!({"a": [1, "two", null]}));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let r = BareReader::new(&[0]);
        assert_eq!(r.finish(), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_huge_list_length_does_not_preallocate() {
        let mut r = BareReader::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(r.get_list(|r| r.get_u8()).is_err());
    }
}
