//! RPC frame header
//!
//! The header is a small protobuf message. Field numbers follow the RPC
//! protocol's `Header` definition; fields outside this set are skipped.

use bytes::{Bytes, BytesMut};

use crate::common::Result;
use super::wire::{self, FieldValue};

/// Service id carried by every request
pub const REQUEST_SERVICE_ID: u32 = 0;

/// Service id carried by every response
pub const RESPONSE_SERVICE_ID: u32 = 254;

/// A header that can prefix a frame
///
/// Implemented by the RPC [`Header`] and by lighter headers that carry no
/// correlation data.
pub trait FrameHeader: Sized + Send {
    fn decode(data: &[u8]) -> Result<Self>;

    fn encode(&self, dst: &mut BytesMut);

    /// Payload size declared inside the header, if any
    fn declared_size(&self) -> Option<u32> {
        None
    }

    /// Keep a declared size in sync with the payload about to be written
    fn set_declared_size(&mut self, _size: u32) {}
}

/// RPC frame header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub service_id: u32,
    pub method_id: u32,
    pub token: u32,
    pub object_id: Option<u64>,
    pub size: Option<u32>,
    pub status: Option<u32>,
    pub timeout: Option<u64>,
    pub is_response: Option<bool>,
    pub service_hash: Option<u32>,
}

impl Header {
    /// Header for a request to `service_hash`/`method_id`
    pub fn request(service_hash: u32, method_id: u32, token: u32) -> Self {
        Self {
            service_id: REQUEST_SERVICE_ID,
            method_id,
            token,
            service_hash: Some(service_hash),
            ..Self::default()
        }
    }

    /// Header for the response to `token`
    pub fn response(token: u32) -> Self {
        Self {
            service_id: RESPONSE_SERVICE_ID,
            token,
            ..Self::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.service_id == REQUEST_SERVICE_ID
    }

    pub fn is_response(&self) -> bool {
        self.service_id == RESPONSE_SERVICE_ID
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl FrameHeader for Header {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut header = Header::default();
        for field in wire::parse_fields(data)? {
            let value = match field.value {
                FieldValue::Varint(v) | FieldValue::Fixed64(v) => v,
                FieldValue::Fixed32(v) => u64::from(v),
                FieldValue::Bytes(_) => continue,
            };
            match field.number {
                1 => header.service_id = value as u32,
                2 => header.method_id = value as u32,
                3 => header.token = value as u32,
                4 => header.object_id = Some(value),
                5 => header.size = Some(value as u32),
                6 => header.status = Some(value as u32),
                8 => header.timeout = Some(value),
                9 => header.is_response = Some(value != 0),
                11 => header.service_hash = Some(value as u32),
                _ => {}
            }
        }
        Ok(header)
    }

    fn encode(&self, dst: &mut BytesMut) {
        wire::put_varint_field(dst, 1, u64::from(self.service_id));
        wire::put_varint_field(dst, 2, u64::from(self.method_id));
        wire::put_varint_field(dst, 3, u64::from(self.token));
        if let Some(object_id) = self.object_id {
            wire::put_varint_field(dst, 4, object_id);
        }
        if let Some(size) = self.size {
            wire::put_varint_field(dst, 5, u64::from(size));
        }
        if let Some(status) = self.status {
            wire::put_varint_field(dst, 6, u64::from(status));
        }
        if let Some(timeout) = self.timeout {
            wire::put_varint_field(dst, 8, timeout);
        }
        if let Some(is_response) = self.is_response {
            wire::put_varint_field(dst, 9, u64::from(is_response));
        }
        if let Some(hash) = self.service_hash {
            wire::put_fixed32_field(dst, 11, hash);
        }
    }

    fn declared_size(&self) -> Option<u32> {
        self.size
    }

    fn set_declared_size(&mut self, size: u32) {
        if self.size.is_some() {
            self.size = Some(size);
        }
    }
}
