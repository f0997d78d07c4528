//! Serializability check for actor state.
//!
//! Walks a value through serde without producing output and reports the
//! first location that cannot be stored or sent to clients: non-finite
//! floats, integers wider than 64 bits, map keys that are not strings or
//! integers, and any error raised by a custom `Serialize` impl.

use serde::ser::{self, Impossible, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InvalidState {
    pub path: String,
    pub reason: String,
}

pub(crate) fn check_serializable<T: Serialize + ?Sized>(value: &T) -> Result<(), InvalidState> {
    value
        .serialize(Walker { path: Vec::new() })
        .map_err(|e| InvalidState {
            path: render(e.path.as_deref().unwrap_or_default()),
            reason: e.reason,
        })
}

#[derive(Debug, Clone)]
enum Segment {
    Field(&'static str),
    Index(usize),
    Key(String),
}

fn render(path: &[Segment]) -> String {
    let mut out = String::from("state");
    for segment in path {
        match segment {
            Segment::Field(name) => {
                out.push('.');
                out.push_str(name);
            }
            Segment::Key(key) => {
                out.push('.');
                out.push_str(key);
            }
            Segment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

#[derive(Debug)]
struct WalkError {
    path: Option<Vec<Segment>>,
    reason: String,
}

impl WalkError {
    /// Records where the error happened unless a deeper level already did.
    fn at(mut self, path: &[Segment]) -> Self {
        if self.path.is_none() {
            self.path = Some(path.to_vec());
        }
        self
    }
}

impl std::fmt::Display for WalkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for WalkError {}

impl ser::Error for WalkError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        WalkError {
            path: None,
            reason: msg.to_string(),
        }
    }
}

#[derive(Clone)]
struct Walker {
    path: Vec<Segment>,
}

impl Walker {
    fn fail(&self, reason: impl Into<String>) -> WalkError {
        WalkError {
            path: Some(self.path.clone()),
            reason: reason.into(),
        }
    }

    fn child(&self, segment: Segment) -> Walker {
        let mut path = self.path.clone();
        path.push(segment);
        Walker { path }
    }

    fn descend<T: Serialize + ?Sized>(&self, segment: Segment, value: &T) -> Result<(), WalkError> {
        let child = self.child(segment);
        let path = child.path.clone();
        value.serialize(child).map_err(|e| e.at(&path))
    }

    fn compound(self) -> Compound {
        Compound {
            walker: self,
            index: 0,
            pending_key: None,
        }
    }
}

impl ser::Serializer for Walker {
    type Ok = ();
    type Error = WalkError;
    type SerializeSeq = Compound;
    type SerializeTuple = Compound;
    type SerializeTupleStruct = Compound;
    type SerializeTupleVariant = Compound;
    type SerializeMap = Compound;
    type SerializeStruct = Compound;
    type SerializeStructVariant = Compound;

    fn serialize_bool(self, _v: bool) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> Result<(), WalkError> {
        if i64::try_from(v).is_ok() || u64::try_from(v).is_ok() {
            Ok(())
        } else {
            Err(self.fail("integer does not fit in 64 bits"))
        }
    }

    fn serialize_u8(self, _v: u8) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_u16(self, _v: u16) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_u32(self, _v: u32) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_u64(self, _v: u64) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> Result<(), WalkError> {
        if u64::try_from(v).is_ok() {
            Ok(())
        } else {
            Err(self.fail("integer does not fit in 64 bits"))
        }
    }

    fn serialize_f32(self, v: f32) -> Result<(), WalkError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(self.fail("non-finite number"))
        }
    }

    fn serialize_f64(self, v: f64) -> Result<(), WalkError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(self.fail("non-finite number"))
        }
    }

    fn serialize_char(self, _v: char) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), WalkError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), WalkError> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), WalkError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), WalkError> {
        self.descend(Segment::Field(variant), value)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound, WalkError> {
        Ok(self.compound())
    }

    fn serialize_tuple(self, _len: usize) -> Result<Compound, WalkError> {
        Ok(self.compound())
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Compound, WalkError> {
        Ok(self.compound())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound, WalkError> {
        Ok(self.child(Segment::Field(variant)).compound())
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Compound, WalkError> {
        Ok(self.compound())
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Compound, WalkError> {
        Ok(self.compound())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Compound, WalkError> {
        Ok(self.child(Segment::Field(variant)).compound())
    }
}

struct Compound {
    walker: Walker,
    index: usize,
    pending_key: Option<String>,
}

impl Compound {
    fn element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        let index = self.index;
        self.index += 1;
        self.walker.descend(Segment::Index(index), value)
    }
}

impl ser::SerializeSeq for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        self.element(value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeTuple for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        self.element(value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        self.element(value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        self.element(value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeMap for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), WalkError> {
        let rendered = key
            .serialize(KeyWalker)
            .map_err(|e| e.at(&self.walker.path))?;
        self.pending_key = Some(rendered);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), WalkError> {
        let key = self.pending_key.take().unwrap_or_default();
        self.walker.descend(Segment::Key(key), value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeStruct for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), WalkError> {
        self.walker.descend(Segment::Field(key), value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for Compound {
    type Ok = ();
    type Error = WalkError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), WalkError> {
        self.walker.descend(Segment::Field(key), value)
    }

    fn end(self) -> Result<(), WalkError> {
        Ok(())
    }
}

/// Accepts map keys that render as strings, returning the rendered key.
struct KeyWalker;

fn bad_key() -> WalkError {
    WalkError {
        path: None,
        reason: "map keys must be strings or integers".into(),
    }
}

impl ser::Serializer for KeyWalker {
    type Ok = String;
    type Error = WalkError;
    type SerializeSeq = Impossible<String, WalkError>;
    type SerializeTuple = Impossible<String, WalkError>;
    type SerializeTupleStruct = Impossible<String, WalkError>;
    type SerializeTupleVariant = Impossible<String, WalkError>;
    type SerializeMap = Impossible<String, WalkError>;
    type SerializeStruct = Impossible<String, WalkError>;
    type SerializeStructVariant = Impossible<String, WalkError>;

    fn serialize_bool(self, _v: bool) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_i8(self, v: i8) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_f64(self, _v: f64) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_char(self, v: char) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, WalkError> {
        Ok(v.to_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_none(self) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_unit(self) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String, WalkError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, WalkError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, WalkError> {
        Err(bad_key())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, WalkError> {
        Err(bad_key())
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, WalkError> {
        Err(bad_key())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, WalkError> {
        Err(bad_key())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, WalkError> {
        Err(bad_key())
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, WalkError> {
        Err(bad_key())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, WalkError> {
        Err(bad_key())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, WalkError> {
        Err(bad_key())
    }
}
