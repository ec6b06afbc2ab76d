use nom::number::complete::{be_f32, be_f64, be_i16, be_i32, be_i64, be_u16, be_u32, be_u64};

use super::tag::Tag;
use super::varint;
use super::{CodecError, CodecResult, Value};

/// Cursor over the decode buffer, mirroring the teacher's `dns::Buffer`
/// current/source split but tracking a plain byte offset instead of a
/// remaining-slice, since the record formats here carry no back-references.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(CodecError::Underflow)?;
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> CodecResult<u32> {
        varint::read(self.buf, &mut self.pos)
    }
}

pub fn decode_value(cursor: &mut Cursor) -> CodecResult<Value> {
    let tag_byte = cursor.byte()?;
    let tag = Tag::from_byte(tag_byte).ok_or(CodecError::InvalidType(tag_byte))?;
    decode_tagged(tag, cursor)
}

fn decode_tagged(tag: Tag, cursor: &mut Cursor) -> CodecResult<Value> {
    Ok(match tag {
        Tag::Null => Value::Null,
        Tag::Undef => Value::Undefined,
        Tag::True => Value::Bool(true),
        Tag::False => Value::Bool(false),
        Tag::Int8 => Value::Int(cursor.byte()? as i8 as i64),
        Tag::Int16 => Value::Int(be_i16_from(cursor)? as i64),
        Tag::Int32 => Value::Int(be_i32_from(cursor)? as i64),
        Tag::Int64 => Value::Int(be_i64_from(cursor)?),
        Tag::UInt8 => Value::UInt(cursor.byte()? as u64),
        Tag::UInt16 => Value::UInt(be_u16_from(cursor)? as u64),
        Tag::UInt32 => Value::UInt(be_u32_from(cursor)? as u64),
        Tag::UInt64 => Value::UInt(be_u64_from(cursor)?),
        Tag::Float32 => Value::Float(be_f32_from(cursor)? as f64),
        Tag::Float64 => Value::Float(be_f64_from(cursor)?),
        Tag::String => {
            let len = cursor.varint()? as usize;
            let bytes = cursor.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| CodecError::Underflow)?;
            Value::Str(s.to_owned())
        }
        Tag::Binary => {
            let len = cursor.varint()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        Tag::Array => {
            let count = cursor.varint()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(cursor)?);
            }
            Value::Array(items)
        }
        Tag::Object => {
            let count = cursor.varint()? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                let key_tag_byte = cursor.byte()?;
                let key_tag =
                    Tag::from_byte(key_tag_byte).ok_or(CodecError::InvalidType(key_tag_byte))?;
                if key_tag != Tag::String {
                    return Err(CodecError::InvalidKey);
                }
                let key = match decode_tagged(Tag::String, cursor)? {
                    Value::Str(s) => s,
                    _ => unreachable!(),
                };
                let value = decode_value(cursor)?;
                fields.push((key, value));
            }
            Value::Object(fields)
        }
        Tag::Date => Value::Date(be_i64_from(cursor)?),
        Tag::Uuid => {
            let bytes = cursor.take(16)?;
            let arr: [u8; 16] = bytes.try_into().expect("slice is exactly 16 bytes");
            Value::Uuid(uuid::Uuid::from_bytes(arr))
        }
    })
}

fn be_i16_from(cursor: &mut Cursor) -> CodecResult<i16> {
    let bytes = cursor.take(2)?;
    let (_, v) = be_i16::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_i32_from(cursor: &mut Cursor) -> CodecResult<i32> {
    let bytes = cursor.take(4)?;
    let (_, v) = be_i32::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_i64_from(cursor: &mut Cursor) -> CodecResult<i64> {
    let bytes = cursor.take(8)?;
    let (_, v) = be_i64::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_u16_from(cursor: &mut Cursor) -> CodecResult<u16> {
    let bytes = cursor.take(2)?;
    let (_, v) = be_u16::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_u32_from(cursor: &mut Cursor) -> CodecResult<u32> {
    let bytes = cursor.take(4)?;
    let (_, v) = be_u32::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_u64_from(cursor: &mut Cursor) -> CodecResult<u64> {
    let bytes = cursor.take(8)?;
    let (_, v) = be_u64::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_f32_from(cursor: &mut Cursor) -> CodecResult<f32> {
    let bytes = cursor.take(4)?;
    let (_, v) = be_f32::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}

fn be_f64_from(cursor: &mut Cursor) -> CodecResult<f64> {
    let bytes = cursor.take(8)?;
    let (_, v) = be_f64::<_, nom::error::Error<&[u8]>>(bytes).map_err(|_| CodecError::Underflow)?;
    Ok(v)
}
