//! Hand-decoded RPC messages
//!
//! Only the messages the proxy rewrites are modelled here. Everything else
//! travels as validated but opaque bytes.

use bytes::{Bytes, BytesMut};

use crate::common::{ProxyError, Result};
use super::wire::{self, Field, FieldValue};

pub const PROCESS_TASK_RESPONSE: &str = "bgs.protocol.game_utilities.v2.client.ProcessTaskResponse";

/// `bgs.protocol.v2.Variant`
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    Message(Bytes),
    FourCc(String),
    Uint(u64),
    /// Any other member of the oneof, kept verbatim
    Other(Field),
}

impl Variant {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut value = None;
        for field in wire::parse_fields(data)? {
            value = Some(match (field.number, &field.value) {
                (1, FieldValue::Varint(v)) => Variant::Bool(*v != 0),
                (2, FieldValue::Varint(v)) => Variant::Int(*v as i64),
                (3, FieldValue::Fixed64(v)) => Variant::Float(f64::from_bits(*v)),
                (4, FieldValue::Bytes(b)) => Variant::String(utf8(b)?),
                (5, FieldValue::Bytes(b)) => Variant::Blob(b.clone()),
                (6, FieldValue::Bytes(b)) => Variant::Message(b.clone()),
                (7, FieldValue::Bytes(b)) => Variant::FourCc(utf8(b)?),
                (8, FieldValue::Varint(v)) => Variant::Uint(*v),
                _ => Variant::Other(field),
            });
        }
        value.ok_or_else(|| ProxyError::Codec("empty variant".to_string()))
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Variant::Bool(v) => wire::put_varint_field(dst, 1, u64::from(*v)),
            Variant::Int(v) => wire::put_varint_field(dst, 2, *v as u64),
            Variant::Float(v) => wire::put_fixed64_field(dst, 3, v.to_bits()),
            Variant::String(v) => wire::put_bytes_field(dst, 4, v.as_bytes()),
            Variant::Blob(v) => wire::put_bytes_field(dst, 5, v),
            Variant::Message(v) => wire::put_bytes_field(dst, 6, v),
            Variant::FourCc(v) => wire::put_bytes_field(dst, 7, v.as_bytes()),
            Variant::Uint(v) => wire::put_varint_field(dst, 8, *v),
            Variant::Other(field) => wire::put_field(dst, field),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) | Variant::FourCc(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Variant::Blob(b) | Variant::Message(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Variant::Uint(v) => Some(*v),
            Variant::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

fn utf8(bytes: &Bytes) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ProxyError::Codec(format!("invalid utf-8: {}", e)))
}

/// `bgs.protocol.v2.Attribute`
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: Variant,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: Variant) -> Self {
        Self { name: name.into(), value }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut name = None;
        let mut value = None;
        for field in wire::parse_fields(data)? {
            match (field.number, &field.value) {
                (1, FieldValue::Bytes(b)) => name = Some(utf8(b)?),
                (2, FieldValue::Bytes(b)) => value = Some(Variant::decode(b)?),
                _ => {}
            }
        }
        Ok(Self {
            name: name.ok_or_else(|| ProxyError::Codec("attribute without name".to_string()))?,
            value: value.ok_or_else(|| ProxyError::Codec("attribute without value".to_string()))?,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        wire::put_bytes_field(dst, 1, self.name.as_bytes());
        let mut value = BytesMut::new();
        self.value.encode(&mut value);
        wire::put_bytes_field(dst, 2, &value);
    }
}

/// `bgs.protocol.game_utilities.v2.client.ProcessTaskResponse`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessTaskResponse {
    pub result: Vec<Attribute>,
}

impl ProcessTaskResponse {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut result = Vec::new();
        for field in wire::parse_fields(data)? {
            if let (1, FieldValue::Bytes(b)) = (field.number, &field.value) {
                result.push(Attribute::decode(b)?);
            }
        }
        Ok(Self { result })
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        for attribute in &self.result {
            let mut item = BytesMut::new();
            attribute.encode(&mut item);
            wire::put_bytes_field(&mut dst, 1, &item);
        }
        dst.freeze()
    }

    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.result.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    /// Replace the value of `name`, appending the attribute if absent
    pub fn set(&mut self, name: &str, value: Variant) {
        match self.result.iter_mut().find(|a| a.name == name) {
            Some(attribute) => attribute.value = value,
            None => self.result.push(Attribute::new(name, value)),
        }
    }
}
