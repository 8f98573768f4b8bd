//! Length-prefixed frame codec
//!
//! One frame on the wire:
//!
//! ```text
//! u16be header_length | header (header_length bytes) | payload
//! ```
//!
//! The payload is either the size declared by the header or everything left
//! in the frame, depending on [`PayloadMode`]. Decoding never fails for lack
//! of bytes; it yields `None` and resumes when more data arrives.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::common::{ProxyError, Result};
use super::header::FrameHeader;

/// Upper bound for a single payload
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// How the payload length is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Byte streams: the header declares the payload size, absent means empty
    Declared,
    /// Message transports: the payload runs to the end of the message unless declared
    Remaining,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<H> {
    pub header: H,
    pub payload: Bytes,
}

/// Codec for `Frame<H>`
#[derive(Debug)]
pub struct FrameCodec<H> {
    mode: PayloadMode,
    _header: PhantomData<fn() -> H>,
}

impl<H> FrameCodec<H> {
    pub fn new(mode: PayloadMode) -> Self {
        Self { mode, _header: PhantomData }
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }
}

impl<H: FrameHeader> Decoder for FrameCodec<H> {
    type Item = Frame<H>;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame<H>>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let header_len = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if src.len() < 2 + header_len {
            src.reserve(2 + header_len - src.len());
            return Ok(None);
        }

        let header = H::decode(&src[2..2 + header_len])?;
        let available = src.len() - 2 - header_len;
        let payload_len = match (self.mode, header.declared_size()) {
            (_, Some(size)) => size as usize,
            (PayloadMode::Declared, None) => 0,
            (PayloadMode::Remaining, None) => available,
        };
        if payload_len > MAX_PAYLOAD {
            return Err(ProxyError::Codec(format!("payload of {} bytes exceeds limit", payload_len)));
        }
        if available < payload_len {
            if self.mode == PayloadMode::Remaining {
                return Err(ProxyError::Codec(format!(
                    "frame declares {} payload bytes but carries {}", payload_len, available
                )));
            }
            src.reserve(payload_len - available);
            return Ok(None);
        }

        src.advance(2 + header_len);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl<H: FrameHeader> Encoder<Frame<H>> for FrameCodec<H> {
    type Error = ProxyError;

    fn encode(&mut self, mut frame: Frame<H>, dst: &mut BytesMut) -> Result<()> {
        let payload_len = u32::try_from(frame.payload.len())
            .map_err(|_| ProxyError::Codec("payload too large".to_string()))?;
        frame.header.set_declared_size(payload_len);

        let mut header = BytesMut::new();
        frame.header.encode(&mut header);
        let header_len = u16::try_from(header.len())
            .map_err(|_| ProxyError::Codec(format!("header of {} bytes does not fit", header.len())))?;

        dst.reserve(2 + header.len() + frame.payload.len());
        dst.put_u16(header_len);
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
