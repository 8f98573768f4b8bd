//! RPC packet codec
//!
//! Wraps [`FrameCodec`] with service resolution and token correlation.
//! Requests resolve through the [`ServiceRegistry`]; responses resolve through
//! the socket's [`PendingResponses`]. Anything unresolved stays raw bytes.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};

use crate::common::{ProxyError, Result};
use super::correlation::PendingResponses;
use super::frame::{Frame, FrameCodec, PayloadMode};
use super::header::Header;
use super::registry::ServiceRegistry;
use super::wire;

/// Decoded payload of a packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Payload of a known message type
    Typed { type_name: String, bytes: Bytes },
    /// Payload that could not be resolved
    Raw(Bytes),
}

impl Payload {
    pub fn bytes(&self) -> &Bytes {
        match self {
            Payload::Typed { bytes, .. } | Payload::Raw(bytes) => bytes,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            Payload::Typed { type_name, .. } => Some(type_name),
            Payload::Raw(_) => None,
        }
    }
}

/// One RPC message
#[derive(Debug, Clone, PartialEq)]
pub struct BgsPacket {
    pub header: Header,
    pub payload: Payload,
}

impl fmt::Display for BgsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service={} method={} token={} {} ({} bytes)",
            self.header.service_id,
            self.header.method_id,
            self.header.token,
            self.payload.type_name().unwrap_or("raw"),
            self.payload.bytes().len()
        )
    }
}

/// Codec for [`BgsPacket`] on one socket
pub struct BgsCodec {
    frames: FrameCodec<Header>,
    registry: Arc<ServiceRegistry>,
    pending: PendingResponses,
}

impl BgsCodec {
    pub fn new(registry: Arc<ServiceRegistry>, mode: PayloadMode) -> Self {
        Self::with_pending(registry, mode, PendingResponses::new())
    }

    /// Codec sharing a correlation table with the other half of the same socket
    pub fn with_pending(registry: Arc<ServiceRegistry>, mode: PayloadMode, pending: PendingResponses) -> Self {
        Self { frames: FrameCodec::new(mode), registry, pending }
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    fn classify(&self, frame: Frame<Header>) -> BgsPacket {
        let Frame { header, payload } = frame;

        let type_name = if header.is_request() {
            self.registry
                .resolve(header.service_hash.unwrap_or_default(), header.method_id)
                .map(|method| method.request_type.clone())
        } else if header.is_response() {
            self.pending
                .take(header.token)
                .and_then(|method| method.response_type.clone())
        } else {
            None
        };

        let payload = match type_name {
            Some(type_name) if wire::is_well_formed(&payload) => Payload::Typed { type_name, bytes: payload },
            Some(type_name) => {
                trace!("Payload of token {} is not a valid {}", header.token, type_name);
                Payload::Raw(payload)
            }
            None => Payload::Raw(payload),
        };
        BgsPacket { header, payload }
    }

    /// Decode one whole transport message
    pub fn decode_message(&mut self, data: &[u8]) -> Result<Option<BgsPacket>> {
        let mut src = BytesMut::from(data);
        let packet = self.decode(&mut src)?;
        if packet.is_some() && !src.is_empty() {
            trace!("Ignoring {} trailing bytes after packet", src.len());
        }
        Ok(packet)
    }

    /// Encode one packet into a whole transport message
    pub fn encode_message(&mut self, packet: BgsPacket) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(packet, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Decoder for BgsCodec {
    type Item = BgsPacket;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BgsPacket>> {
        Ok(self.frames.decode(src)?.map(|frame| self.classify(frame)))
    }
}

impl Encoder<BgsPacket> for BgsCodec {
    type Error = ProxyError;

    fn encode(&mut self, packet: BgsPacket, dst: &mut BytesMut) -> Result<()> {
        let BgsPacket { header, payload } = packet;
        if header.is_request() {
            if let Some(method) = self.registry.resolve(header.service_hash.unwrap_or_default(), header.method_id) {
                self.pending.record(header.token, method);
            }
        }

        let payload = match payload {
            Payload::Typed { bytes, .. } | Payload::Raw(bytes) => bytes,
        };
        self.frames.encode(Frame { header, payload }, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{REQUEST_SERVICE_ID, RESPONSE_SERVICE_ID};
    use crate::protocol::messages::{Attribute, ProcessTaskResponse, Variant, PROCESS_TASK_RESPONSE};
    use crate::protocol::registry::service_hash;

    const UTILITIES: &str = "bgs.protocol.game_utilities.v2.client.GameUtilitiesService";
    const CONNECTION: &str = "bgs.protocol.connection.v1.ConnectionService";

    fn codec() -> BgsCodec {
        BgsCodec::new(Arc::new(ServiceRegistry::builtin()), PayloadMode::Remaining)
    }

    fn request(service: &str, method_id: u32, token: u32) -> BgsPacket {
        BgsPacket {
            header: Header::request(service_hash(service), method_id, token),
            payload: Payload::Raw(Bytes::from_static(b"\x08\x01")),
        }
    }

    fn response(token: u32) -> Bytes {
        let body = ProcessTaskResponse {
            result: vec![Attribute::new("response_type", Variant::String("ReferralInfo".to_string()))],
        }
        .encode();
        let mut other_side = codec();
        other_side
            .encode_message(BgsPacket { header: Header::response(token), payload: Payload::Raw(body) })
            .unwrap()
    }

    #[test]
    fn test_request_decodes_typed() {
        let message = codec().encode_message(request(UTILITIES, 1, 5)).unwrap();
        let packet = codec().decode_message(&message).unwrap().unwrap();
        assert_eq!(packet.header.service_id, REQUEST_SERVICE_ID);
        assert_eq!(
            packet.payload.type_name(),
            Some("bgs.protocol.game_utilities.v2.client.ProcessTaskRequest")
        );
    }

    #[test]
    fn test_response_correlates_with_encoded_request() {
        let mut leg = codec();
        leg.encode_message(request(UTILITIES, 1, 5)).unwrap();
        assert_eq!(leg.pending().len(), 1);

        let packet = leg.decode_message(&response(5)).unwrap().unwrap();
        assert_eq!(packet.header.service_id, RESPONSE_SERVICE_ID);
        assert_eq!(packet.payload.type_name(), Some(PROCESS_TASK_RESPONSE));

        // consumed exactly once
        let again = leg.decode_message(&response(5)).unwrap().unwrap();
        assert_eq!(again.payload.type_name(), None);
    }

    #[test]
    fn test_unknown_token_stays_raw() {
        let mut leg = codec();
        leg.encode_message(request(UTILITIES, 1, 5)).unwrap();
        let packet = leg.decode_message(&response(6)).unwrap().unwrap();
        assert!(matches!(packet.payload, Payload::Raw(_)));
        assert_eq!(leg.pending().len(), 1);
    }

    #[test]
    fn test_void_request_is_not_recorded() {
        let mut leg = codec();
        leg.encode_message(request(CONNECTION, 5, 8)).unwrap();
        assert!(leg.pending().is_empty());
        let packet = leg.decode_message(&response(8)).unwrap().unwrap();
        assert!(matches!(packet.payload, Payload::Raw(_)));
    }

    #[test]
    fn test_unresolved_request_stays_raw() {
        let mut leg = codec();
        let message = leg.encode_message(request("example.Unknown", 1, 1)).unwrap();
        let packet = codec().decode_message(&message).unwrap().unwrap();
        assert_eq!(packet.payload, Payload::Raw(Bytes::from_static(b"\x08\x01")));
        assert!(leg.pending().is_empty());
    }

    #[test]
    fn test_split_halves_share_correlation() {
        let registry = Arc::new(ServiceRegistry::builtin());
        let mut writer = BgsCodec::new(Arc::clone(&registry), PayloadMode::Remaining);
        let mut reader = BgsCodec::with_pending(registry, PayloadMode::Remaining, writer.pending().clone());

        writer.encode_message(request(UTILITIES, 1, 9)).unwrap();
        let packet = reader.decode_message(&response(9)).unwrap().unwrap();
        assert_eq!(packet.payload.type_name(), Some(PROCESS_TASK_RESPONSE));
    }
}
