//! Self-describing tag-prefixed binary value encoding.
//!
//! Every value starts with a one-byte tag. Compound values (strings, binary
//! blobs, arrays, objects) are followed by a variable-length big-endian
//! length prefix, then their payload. Numeric scalars are big-endian.
//!
//! The wire format distinguishes signed-integer widths (INT8..INT64),
//! unsigned-integer widths (UINT8..UINT64) and float widths (FLOAT32,
//! FLOAT64) purely to keep small values small on disk; at the `Value` level
//! every signed integer normalizes to `Int`, every unsigned integer to
//! `UInt`, and every real to `Float`. That normalization is what makes the
//! round-trip law `decode(encode(v)) == v` hold regardless of which wire
//! width the encoder happened to pick.

mod decode;
mod encode;
mod tag;
mod varint;

pub use tag::Tag;

use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid type tag 0x{0:02x}")]
    InvalidType(u8),
    #[error("read past end of buffer")]
    Underflow,
    #[error("malformed varint length prefix")]
    InvalidVarint,
    #[error("object key must be encoded as a string")]
    InvalidKey,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A decoded/encodable dynamic value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Uuid(Uuid),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) if v <= i64::MAX as u64 => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt(v) => Some(v),
            Value::Int(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_date_ms(&self) -> Option<i64> {
        match self {
            Value::Date(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Look up a field by key in an `Object` value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Helper for building an `Object` value field-by-field, mirroring the
/// teacher's `Header::new`-style plain positional constructors.
#[derive(Debug, Default)]
pub struct ObjectBuilder(Vec<(String, Value)>);

impl ObjectBuilder {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.push((key.into(), value));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.0)
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode::encode_into(value, &mut out);
    out
}

pub fn decode(buffer: &[u8]) -> CodecResult<Value> {
    let mut cursor = decode::Cursor::new(buffer);
    decode::decode_value(&mut cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(v: Value) {
        let bytes = encode(&v);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn roundtrip_primitives() {
        roundtrip(Value::Null);
        roundtrip(Value::Undefined);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(-1));
        roundtrip(Value::UInt(u64::MAX));
        roundtrip(Value::Str("hello".into()));
        roundtrip(Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Date(1_700_000_000_000));
        roundtrip(Value::Uuid(Uuid::nil()));
    }

    #[test]
    fn roundtrip_compound() {
        roundtrip(Value::Array(vec![Value::Int(1), Value::Str("x".into())]));
        let obj = ObjectBuilder::new()
            .field("a", Value::Int(1))
            .field("b", Value::Str("two".into()))
            .build();
        roundtrip(obj);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = decode(&[0xff]).unwrap_err();
        assert_eq!(err, CodecError::InvalidType(0xff));
    }

    #[test]
    fn decode_rejects_underflow() {
        // STRING tag claiming a length that overruns the buffer.
        let err = decode(&[Tag::String as u8, 0x05, b'h', b'i']).unwrap_err();
        assert_eq!(err, CodecError::Underflow);
    }

    #[test]
    fn decode_rejects_non_string_object_key() {
        let bytes = vec![
            Tag::Object as u8,
            0x01,
            Tag::Int8 as u8,
            0x01,
            Tag::Int8 as u8,
            0x02,
        ];
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err, CodecError::InvalidKey);
    }

    #[test]
    fn integers_pick_smallest_width() {
        assert_eq!(encode(&Value::Int(5))[0], Tag::Int8 as u8);
        assert_eq!(encode(&Value::Int(300))[0], Tag::Int16 as u8);
        assert_eq!(encode(&Value::Int(-1))[0], Tag::Int8 as u8);
        assert_eq!(encode(&Value::Int(70_000))[0], Tag::Int32 as u8);
        assert_eq!(encode(&Value::Int(i64::MAX))[0], Tag::Int64 as u8);
    }

    #[test]
    fn unsigned_pick_smallest_width() {
        assert_eq!(encode(&Value::UInt(5))[0], Tag::UInt8 as u8);
        assert_eq!(encode(&Value::UInt(300))[0], Tag::UInt16 as u8);
        assert_eq!(encode(&Value::UInt(u64::MAX))[0], Tag::UInt64 as u8);
    }

    #[test]
    fn float_prefers_f32_when_lossless() {
        assert_eq!(encode(&Value::Float(1.5))[0], Tag::Float32 as u8);
        // Not representable exactly in f32.
        let lossy = 1.0 / 3.0_f64;
        assert_eq!(encode(&Value::Float(lossy))[0], Tag::Float64 as u8);
    }

    #[test]
    fn array_and_object_length_prefix_widths() {
        // 200 entries needs the 2-byte varint form (top bits `10`).
        let arr = Value::Array((0..200).map(Value::Int).collect());
        let bytes = encode(&arr);
        assert_eq!(bytes[0], Tag::Array as u8);
        assert_eq!(bytes[1] & 0b1100_0000, 0b1000_0000);
        roundtrip(arr);
    }
}
