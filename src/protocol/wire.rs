//! Protobuf wire primitives
//!
//! Just enough of the protobuf encoding to read and write message headers and
//! walk unknown messages field by field. There is no schema or reflection here.

use bytes::{Buf, BufMut, Bytes};

use crate::common::{ProxyError, Result};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

/// Value of one decoded field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Bytes(Bytes),
    Fixed32(u32),
}

/// One field of a protobuf message
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub number: u32,
    pub value: FieldValue,
}

impl Field {
    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => Some(v),
            FieldValue::Fixed32(v) => Some(u64::from(v)),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.value {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Read a base-128 varint
pub fn get_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(ProxyError::Codec("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProxyError::Codec("varint longer than 10 bytes".to_string()))
}

pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

fn put_tag(buf: &mut impl BufMut, number: u32, wire_type: u8) {
    put_varint(buf, (u64::from(number) << 3) | u64::from(wire_type));
}

pub fn put_varint_field(buf: &mut impl BufMut, number: u32, value: u64) {
    put_tag(buf, number, WIRE_VARINT);
    put_varint(buf, value);
}

pub fn put_fixed32_field(buf: &mut impl BufMut, number: u32, value: u32) {
    put_tag(buf, number, WIRE_FIXED32);
    buf.put_u32_le(value);
}

pub fn put_fixed64_field(buf: &mut impl BufMut, number: u32, value: u64) {
    put_tag(buf, number, WIRE_FIXED64);
    buf.put_u64_le(value);
}

pub fn put_bytes_field(buf: &mut impl BufMut, number: u32, value: &[u8]) {
    put_tag(buf, number, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Re-emit a field exactly as it was read
pub fn put_field(buf: &mut impl BufMut, field: &Field) {
    match &field.value {
        FieldValue::Varint(v) => put_varint_field(buf, field.number, *v),
        FieldValue::Fixed64(v) => put_fixed64_field(buf, field.number, *v),
        FieldValue::Bytes(b) => put_bytes_field(buf, field.number, b),
        FieldValue::Fixed32(v) => put_fixed32_field(buf, field.number, *v),
    }
}

/// Read the next field, or `None` at the end of the message
pub fn next_field(buf: &mut Bytes) -> Result<Option<Field>> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    let tag = get_varint(buf)?;
    let number = u32::try_from(tag >> 3)
        .map_err(|_| ProxyError::Codec(format!("field number out of range in tag {}", tag)))?;
    if number == 0 {
        return Err(ProxyError::Codec("field number 0".to_string()));
    }

    let value = match (tag & 0x7) as u8 {
        WIRE_VARINT => FieldValue::Varint(get_varint(buf)?),
        WIRE_FIXED64 => {
            if buf.remaining() < 8 {
                return Err(ProxyError::Codec("truncated fixed64".to_string()));
            }
            FieldValue::Fixed64(buf.get_u64_le())
        }
        WIRE_LEN => {
            let len = get_varint(buf)? as usize;
            if buf.remaining() < len {
                return Err(ProxyError::Codec(format!(
                    "field {} declares {} bytes, {} remaining", number, len, buf.remaining()
                )));
            }
            FieldValue::Bytes(buf.split_to(len))
        }
        WIRE_FIXED32 => {
            if buf.remaining() < 4 {
                return Err(ProxyError::Codec("truncated fixed32".to_string()));
            }
            FieldValue::Fixed32(buf.get_u32_le())
        }
        other => return Err(ProxyError::Codec(format!("unsupported wire type {}", other))),
    };

    Ok(Some(Field { number, value }))
}

/// Decode every top-level field of a message
pub fn parse_fields(data: &[u8]) -> Result<Vec<Field>> {
    let mut buf = Bytes::copy_from_slice(data);
    let mut fields = Vec::new();
    while let Some(field) = next_field(&mut buf)? {
        fields.push(field);
    }
    Ok(fields)
}

/// Whether `data` is a well-formed protobuf message at the top level
pub fn is_well_formed(data: &[u8]) -> bool {
    parse_fields(data).is_ok()
}
