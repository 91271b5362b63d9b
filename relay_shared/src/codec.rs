//! Binary value codec.
//!
//! Schema-driven encoding of the value shapes the relay protocol ships:
//! fixed-width primitives, UTF-8 strings, lists, arrays, nullables, and
//! record types walked field-by-field in declared order. Everything is
//! little-endian; counts and lengths are signed 32-bit with `-1` as the
//! null sentinel where the shape admits null.
//!
//! The codec is a pure transform: `decode(encode(v)) == v` for every
//! supported value, and the encoded length of a value is fully determined
//! by its runtime shape. Records carry no discriminator — the ordered
//! field schema alone determines layout, so a value whose shape disagrees
//! with its declared type is a hard error, never a warning.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Errors raised while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value shape does not match wire type: expected {expected}, got {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },
    #[error("{remaining} trailing bytes after decode")]
    TrailingBytes { remaining: usize },
    #[error("invalid count {0}")]
    InvalidCount(i32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("record {record} declares {expected} fields, got {found}")]
    FieldCount {
        record: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Wire-level type descriptor.
///
/// A `WireType` fully determines the layout of its values; composite
/// records embed their ordered field list via [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub enum WireType {
    Bool,
    U8,
    I32,
    I64,
    F32,
    F64,
    /// UTF-8, length-prefixed, `-1` length denotes null.
    Str,
    /// Enum discriminant carried as int32.
    Enum,
    /// Count-prefixed homogeneous sequence; never null.
    List(Box<WireType>),
    /// Count-prefixed homogeneous sequence; `-1` count denotes null.
    Array(Box<WireType>),
    /// One presence byte, then the inner value if present.
    Nullable(Box<WireType>),
    /// Fields in declared order, no discriminator, no padding.
    Record(Schema),
}

impl WireType {
    pub fn list(elem: WireType) -> Self {
        WireType::List(Box::new(elem))
    }

    pub fn array(elem: WireType) -> Self {
        WireType::Array(Box::new(elem))
    }

    pub fn nullable(inner: WireType) -> Self {
        WireType::Nullable(Box::new(inner))
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            WireType::Bool => "bool",
            WireType::U8 => "u8",
            WireType::I32 => "i32",
            WireType::I64 => "i64",
            WireType::F32 => "f32",
            WireType::F64 => "f64",
            WireType::Str => "string",
            WireType::Enum => "enum",
            WireType::List(_) => "list",
            WireType::Array(_) => "array",
            WireType::Nullable(_) => "nullable",
            WireType::Record(_) => "record",
        }
    }
}

/// One named field of a record schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub ty: WireType,
}

/// Ordered field list describing a record type's layout.
///
/// Schemas are built once at registration time and must be identical on
/// every peer that exchanges values of the type.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: &'static str,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: &'static str, fields: Vec<(&'static str, WireType)>) -> Self {
        Schema {
            name,
            fields: fields
                .into_iter()
                .map(|(name, ty)| Field { name, ty })
                .collect(),
        }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// A decoded value, shaped one-to-one with [`WireType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Option<String>),
    Enum(i32),
    List(Vec<Value>),
    Array(Option<Vec<Value>>),
    Nullable(Option<Box<Value>>),
    Record(Vec<Value>),
}

impl Value {
    /// Convenience constructor for a present string.
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Some(s.into()))
    }

    /// Short name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Enum(_) => "enum",
            Value::List(_) => "list",
            Value::Array(_) => "array",
            Value::Nullable(_) => "nullable",
            Value::Record(_) => "record",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Encodes a value against its declared wire type.
pub fn encode(value: &Value, ty: &WireType) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    write_value(&mut buf, value, ty)?;
    Ok(buf.to_vec())
}

/// Decodes a value against its declared wire type.
///
/// The input must be exactly one encoded value; trailing bytes are
/// rejected, since leftover input means the stream is misaligned.
pub fn decode(bytes: &[u8], ty: &WireType) -> Result<Value, CodecError> {
    let mut input = bytes;
    let value = read_value(&mut input, ty)?;
    if !input.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: input.len(),
        });
    }
    Ok(value)
}

fn mismatch(ty: &WireType, value: &Value) -> CodecError {
    CodecError::Mismatch {
        expected: ty.name(),
        found: value.type_name(),
    }
}

pub(crate) fn write_value(
    buf: &mut BytesMut,
    value: &Value,
    ty: &WireType,
) -> Result<(), CodecError> {
    match (ty, value) {
        (WireType::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
        (WireType::U8, Value::U8(v)) => buf.put_u8(*v),
        (WireType::I32, Value::I32(v)) => buf.put_i32_le(*v),
        (WireType::I64, Value::I64(v)) => buf.put_i64_le(*v),
        (WireType::F32, Value::F32(v)) => buf.put_f32_le(*v),
        (WireType::F64, Value::F64(v)) => buf.put_f64_le(*v),
        (WireType::Enum, Value::Enum(v)) => buf.put_i32_le(*v),
        (WireType::Str, Value::Str(s)) => write_str(buf, s.as_deref()),
        (WireType::List(elem), Value::List(items)) => {
            buf.put_i32_le(items.len() as i32);
            for item in items {
                write_value(buf, item, elem)?;
            }
        }
        (WireType::Array(_), Value::Array(None)) => buf.put_i32_le(-1),
        (WireType::Array(elem), Value::Array(Some(items))) => {
            buf.put_i32_le(items.len() as i32);
            for item in items {
                write_value(buf, item, elem)?;
            }
        }
        (WireType::Nullable(_), Value::Nullable(None)) => buf.put_u8(0),
        (WireType::Nullable(inner), Value::Nullable(Some(v))) => {
            buf.put_u8(1);
            write_value(buf, v, inner)?;
        }
        (WireType::Record(schema), Value::Record(values)) => {
            if values.len() != schema.fields.len() {
                return Err(CodecError::FieldCount {
                    record: schema.name,
                    expected: schema.fields.len(),
                    found: values.len(),
                });
            }
            for (value, field) in values.iter().zip(&schema.fields) {
                write_value(buf, value, &field.ty)?;
            }
        }
        (ty, value) => return Err(mismatch(ty, value)),
    }
    Ok(())
}

pub(crate) fn read_value(input: &mut &[u8], ty: &WireType) -> Result<Value, CodecError> {
    let value = match ty {
        WireType::Bool => match take(input, 1)?.get_u8() {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => {
                return Err(CodecError::Mismatch {
                    expected: "bool",
                    found: "byte",
                })
            }
        },
        WireType::U8 => Value::U8(take(input, 1)?.get_u8()),
        WireType::I32 => Value::I32(take(input, 4)?.get_i32_le()),
        WireType::I64 => Value::I64(take(input, 8)?.get_i64_le()),
        WireType::F32 => Value::F32(take(input, 4)?.get_f32_le()),
        WireType::F64 => Value::F64(take(input, 8)?.get_f64_le()),
        WireType::Enum => Value::Enum(take(input, 4)?.get_i32_le()),
        WireType::Str => Value::Str(read_str(input)?),
        WireType::List(elem) => {
            let count = take(input, 4)?.get_i32_le();
            if count < 0 {
                return Err(CodecError::InvalidCount(count));
            }
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(read_value(input, elem)?);
            }
            Value::List(items)
        }
        WireType::Array(elem) => {
            let count = take(input, 4)?.get_i32_le();
            if count == -1 {
                Value::Array(None)
            } else if count < 0 {
                return Err(CodecError::InvalidCount(count));
            } else {
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(read_value(input, elem)?);
                }
                Value::Array(Some(items))
            }
        }
        WireType::Nullable(inner) => match take(input, 1)?.get_u8() {
            0 => Value::Nullable(None),
            1 => Value::Nullable(Some(Box::new(read_value(input, inner)?))),
            _ => {
                return Err(CodecError::Mismatch {
                    expected: "nullable",
                    found: "byte",
                })
            }
        },
        WireType::Record(schema) => {
            let mut values = Vec::with_capacity(schema.fields.len());
            for field in &schema.fields {
                values.push(read_value(input, &field.ty)?);
            }
            Value::Record(values)
        }
    };
    Ok(value)
}

/// Writes a length-prefixed UTF-8 string, `-1` for null.
pub(crate) fn write_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        None => buf.put_i32_le(-1),
        Some(s) => {
            buf.put_i32_le(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
    }
}

/// Reads a length-prefixed UTF-8 string, `-1` as null.
pub(crate) fn read_str(input: &mut &[u8]) -> Result<Option<String>, CodecError> {
    let len = take(input, 4)?.get_i32_le();
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(CodecError::InvalidCount(len));
    }
    let raw = take(input, len as usize)?;
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Writes a length-prefixed byte blob.
pub(crate) fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32_le(bytes.len() as i32);
    buf.put_slice(bytes);
}

/// Reads a length-prefixed byte blob.
pub(crate) fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = take(input, 4)?.get_i32_le();
    if len < 0 {
        return Err(CodecError::InvalidCount(len));
    }
    Ok(take(input, len as usize)?.to_vec())
}

/// Splits `n` bytes off the front of the input, or fails with how many
/// bytes were missing.
pub(crate) fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::UnexpectedEof {
            needed: n - input.len(),
        });
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}
