//! Password-keyed login handshake
//!
//! The client opens with a magic string and then runs an SRP-6a exchange
//! keyed by material the backend handed out earlier (see [`SrpMaterial`]).
//! [`ProSession`] plays the server side of that exchange against the client's
//! bytes. It never consumes them: callers forward the same bytes upstream
//! and decide what to do with the replies it computes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, warn};
use openssl::bn::BigNum;
use openssl::rand::rand_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ProxyError, Result};
use crate::protocol::messages::ProcessTaskResponse;
use super::srp::{self, SrpGroup, SrpServer, SALT_LEN};

pub const CLIENT_MAGIC: &[u8] = b"HELLO PRO CLIENT\0";
pub const SERVER_MAGIC: &[u8] = b"HELLO PRO SERVER\0";

/// Bytes kept after a failed magic search so a split magic still matches
const MAGIC_TAIL: usize = CLIENT_MAGIC.len() - 1;

const IDENTIFIER_LEN: usize = 8;
const EVIDENCE_LEN: usize = 32;
const M2_PADDING: usize = 292;

/// Named phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ProPhase {
    Handshake,
    LoginExchange1,
    LoginExchange2,
    Encrypted,
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Key material for one client, handed out by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrpMaterial {
    #[serde(default)]
    pub cid: u64,
    #[serde(default, with = "base64_bytes")]
    pub k0: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub k1: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub k2: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub k3: Vec<u8>,
    /// Modulus, big-endian; generated per connection when absent
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub n: Option<Vec<u8>>,
    /// Generator, big-endian; 2 when absent
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub g: Option<Vec<u8>>,
}

/// Accepted shapes of an update body
#[derive(Deserialize)]
#[serde(untagged)]
enum MaterialUpdate {
    /// Base64 of an encoded `ProcessTaskResponse`
    Encoded(String),
    Material(SrpMaterial),
}

impl SrpMaterial {
    /// Pick `cid` and `k0`..`k3` out of a task response
    pub fn from_task_response(response: &ProcessTaskResponse) -> Self {
        let blob = |name: &str| {
            response
                .get(name)
                .and_then(|value| value.as_blob())
                .map(|bytes| bytes.to_vec())
                .unwrap_or_default()
        };
        Self {
            cid: response.get("cid").and_then(|value| value.as_u64()).unwrap_or_default(),
            k0: blob("k0"),
            k1: blob("k1"),
            k2: blob("k2"),
            k3: blob("k3"),
            n: None,
            g: None,
        }
    }

    /// Parse the body of an update request
    pub fn from_update(body: Value) -> Result<Self> {
        match serde_json::from_value(body)? {
            MaterialUpdate::Encoded(encoded) => {
                let bytes = STANDARD
                    .decode(encoded)
                    .map_err(|e| ProxyError::Codec(format!("invalid base64: {}", e)))?;
                Ok(Self::from_task_response(&ProcessTaskResponse::decode(&bytes)?))
            }
            MaterialUpdate::Material(material) => Ok(material),
        }
    }

    fn group(&self) -> Result<SrpGroup> {
        match (&self.n, &self.g) {
            (Some(n), Some(g)) => SrpGroup::from_bytes(n, g),
            (Some(n), None) => SrpGroup::from_bytes(n, &[srp::GENERATOR as u8]),
            (None, _) => SrpGroup::generate(),
        }
    }
}

/// Something the session wants its driver to act on
#[derive(Debug, Clone, PartialEq)]
pub enum ProOutput {
    /// Bytes the server side would send to the client
    Reply(Bytes),
    /// The session advanced
    Phase(ProPhase),
    /// Outcome of the evidence check
    Authenticated(bool),
}

enum ProState {
    Handshake,
    LoginExchange1,
    LoginExchange2 { server: SrpServer, a: BigNum },
    Encrypted,
}

/// Server side of one client's handshake
pub struct ProSession {
    state: ProState,
    buffer: BytesMut,
    material: SrpMaterial,
    group: Option<SrpGroup>,
    authenticated: bool,
}

impl ProSession {
    pub fn new(material: SrpMaterial) -> Result<Self> {
        let group = material.group()?;
        Ok(Self {
            state: ProState::Handshake,
            buffer: BytesMut::new(),
            material,
            group: Some(group),
            authenticated: false,
        })
    }

    pub fn phase(&self) -> ProPhase {
        match self.state {
            ProState::Handshake => ProPhase::Handshake,
            ProState::LoginExchange1 => ProPhase::LoginExchange1,
            ProState::LoginExchange2 { .. } => ProPhase::LoginExchange2,
            ProState::Encrypted => ProPhase::Encrypted,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Feed bytes the client sent, returning everything the session produced
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<ProOutput>> {
        let mut outputs = Vec::new();
        if matches!(self.state, ProState::Encrypted) {
            return Ok(outputs);
        }
        self.buffer.extend_from_slice(data);
        while self.step(&mut outputs)? {}
        Ok(outputs)
    }

    /// Advance at most one phase; false when more bytes are needed
    fn step(&mut self, outputs: &mut Vec<ProOutput>) -> Result<bool> {
        match &self.state {
            ProState::Handshake => {
                let found = self
                    .buffer
                    .windows(CLIENT_MAGIC.len())
                    .position(|window| window == CLIENT_MAGIC);
                match found {
                    Some(start) => {
                        self.buffer.advance(start + CLIENT_MAGIC.len());
                        outputs.push(ProOutput::Reply(Bytes::from_static(SERVER_MAGIC)));
                        self.advance(ProState::LoginExchange1, outputs);
                        Ok(true)
                    }
                    None => {
                        if self.buffer.len() > MAGIC_TAIL {
                            let skip = self.buffer.len() - MAGIC_TAIL;
                            self.buffer.advance(skip);
                        }
                        Ok(false)
                    }
                }
            }
            ProState::LoginExchange1 => {
                let group_len = self.group.as_ref().map(SrpGroup::len).unwrap_or_default();
                if self.buffer.len() < IDENTIFIER_LEN + group_len {
                    return Ok(false);
                }
                let identifier = self.buffer.get_u64_le();
                let a = BigNum::from_slice(&self.buffer.split_to(group_len))?;
                debug!("Login exchange 1 from {} with {} byte public value", identifier, group_len);

                let group = self
                    .group
                    .take()
                    .ok_or_else(|| ProxyError::Handshake("SRP group already consumed".to_string()))?;
                let mut salt = [0u8; SALT_LEN];
                rand_bytes(&mut salt)?;
                let server = SrpServer::new(group, &salt, &self.material.k0)?;

                let mut reply = BytesMut::with_capacity(SALT_LEN + 1 + group_len);
                reply.extend_from_slice(&salt);
                reply.extend_from_slice(&server.group().g.to_vec());
                reply.extend_from_slice(&server.group().pad(server.public())?);
                outputs.push(ProOutput::Reply(reply.freeze()));

                self.advance(ProState::LoginExchange2 { server, a }, outputs);
                Ok(true)
            }
            ProState::LoginExchange2 { server, a } => {
                if self.buffer.len() < IDENTIFIER_LEN + EVIDENCE_LEN {
                    return Ok(false);
                }
                let identifier = self.buffer.get_u64_le();
                let m1 = self.buffer.split_to(EVIDENCE_LEN);

                let s = server.session_key(a)?;
                let expected = srp::client_evidence(a, server.public(), &s);
                self.authenticated = expected[..] == m1[..];
                if self.authenticated {
                    info!("Client {} authenticated", identifier);
                } else {
                    warn!("Client {} sent evidence that does not match", identifier);
                }
                outputs.push(ProOutput::Authenticated(self.authenticated));

                let m2 = srp::server_evidence(a, &m1, &s);
                let mut reply = BytesMut::with_capacity(EVIDENCE_LEN + M2_PADDING);
                reply.extend_from_slice(&m2);
                reply.resize(EVIDENCE_LEN + M2_PADDING, 0);
                outputs.push(ProOutput::Reply(reply.freeze()));

                self.advance(ProState::Encrypted, outputs);
                self.buffer.clear();
                Ok(false)
            }
            ProState::Encrypted => Ok(false),
        }
    }

    fn advance(&mut self, next: ProState, outputs: &mut Vec<ProOutput>) {
        self.state = next;
        let phase = self.phase();
        debug!("Handshake advanced to {:?}", phase);
        outputs.push(ProOutput::Phase(phase));
    }
}
