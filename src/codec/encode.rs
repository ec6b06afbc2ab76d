use super::tag::Tag;
use super::varint;
use super::Value;

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(Tag::Null as u8),
        Value::Undefined => out.push(Tag::Undef as u8),
        Value::Bool(true) => out.push(Tag::True as u8),
        Value::Bool(false) => out.push(Tag::False as u8),
        Value::Int(v) => encode_int(*v, out),
        Value::UInt(v) => encode_uint(*v, out),
        Value::Float(v) => encode_float(*v, out),
        Value::Str(s) => encode_string(s.as_bytes(), out),
        Value::Bytes(b) => {
            out.push(Tag::Binary as u8);
            varint::write(b.len() as u32, out);
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            out.push(Tag::Array as u8);
            varint::write(items.len() as u32, out);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Object(fields) => {
            out.push(Tag::Object as u8);
            varint::write(fields.len() as u32, out);
            for (key, val) in fields {
                encode_string(key.as_bytes(), out);
                encode_into(val, out);
            }
        }
        Value::Date(ms) => {
            out.push(Tag::Date as u8);
            out.extend_from_slice(&ms.to_be_bytes());
        }
        Value::Uuid(u) => {
            out.push(Tag::Uuid as u8);
            out.extend_from_slice(u.as_bytes());
        }
    }
}

fn encode_string(bytes: &[u8], out: &mut Vec<u8>) {
    out.push(Tag::String as u8);
    varint::write(bytes.len() as u32, out);
    out.extend_from_slice(bytes);
}

/// Picks the smallest signed width that round-trips `v`.
fn encode_int(v: i64, out: &mut Vec<u8>) {
    if let Ok(v8) = i8::try_from(v) {
        out.push(Tag::Int8 as u8);
        out.push(v8 as u8);
    } else if let Ok(v16) = i16::try_from(v) {
        out.push(Tag::Int16 as u8);
        out.extend_from_slice(&v16.to_be_bytes());
    } else if let Ok(v32) = i32::try_from(v) {
        out.push(Tag::Int32 as u8);
        out.extend_from_slice(&v32.to_be_bytes());
    } else {
        out.push(Tag::Int64 as u8);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Picks the smallest unsigned width that round-trips `v`.
fn encode_uint(v: u64, out: &mut Vec<u8>) {
    if let Ok(v8) = u8::try_from(v) {
        out.push(Tag::UInt8 as u8);
        out.push(v8);
    } else if let Ok(v16) = u16::try_from(v) {
        out.push(Tag::UInt16 as u8);
        out.extend_from_slice(&v16.to_be_bytes());
    } else if let Ok(v32) = u32::try_from(v) {
        out.push(Tag::UInt32 as u8);
        out.extend_from_slice(&v32.to_be_bytes());
    } else {
        out.push(Tag::UInt64 as u8);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

/// Uses FLOAT32 iff narrowing to single precision and back is lossless,
/// else FLOAT64.
fn encode_float(v: f64, out: &mut Vec<u8>) {
    let narrowed = v as f32;
    if narrowed as f64 == v {
        out.push(Tag::Float32 as u8);
        out.extend_from_slice(&narrowed.to_be_bytes());
    } else {
        out.push(Tag::Float64 as u8);
        out.extend_from_slice(&v.to_be_bytes());
    }
}
