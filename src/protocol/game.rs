//! Game-network framing
//!
//! Each transport frame is a u32 length-prefixed batch. Once a session is
//! keyed the batch is encrypted with [`crate::handshake::cipher`]. Inside a
//! batch, packets are varint length-prefixed and each packet is an
//! uncorrelated [`FrameCodec`] frame whose header packs
//! `id | sender << 10 | target << 12` into a varint.
//!
//! A [`GameCodec`] instance serves one direction of one socket. Cipher and
//! registry changes reach it either in-band as [`GameFrame::Update`] on the
//! write side, or through its update channel, which is drained before every
//! frame.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::common::{ProxyError, Result};
use crate::handshake::cipher::{Decryptor, Encryptor};
use crate::handshake::palette::{BlockDefinition, TypeRegistry};
use super::frame::{Frame, FrameCodec, PayloadMode};
use super::header::FrameHeader;
use super::wire::{get_varint, put_varint};

pub const LOGIN: u32 = 0x01;
pub const SERVER_TO_CLIENT_HANDSHAKE: u32 = 0x03;
pub const CLIENT_TO_SERVER_HANDSHAKE: u32 = 0x04;
pub const START_GAME: u32 = 0x0b;
pub const UPDATE_BLOCK: u32 = 0x15;

/// Packet header without correlation data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GameHeader {
    pub id: u32,
    pub sender: u8,
    pub target: u8,
}

impl GameHeader {
    pub fn new(id: u32) -> Self {
        Self { id, ..Self::default() }
    }
}

impl FrameHeader for GameHeader {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let value = get_varint(&mut buf)?;
        if buf.has_remaining() {
            return Err(ProxyError::Codec("trailing bytes in packet header".to_string()));
        }
        Ok(Self {
            id: (value & 0x3ff) as u32,
            sender: ((value >> 10) & 0x3) as u8,
            target: ((value >> 12) & 0x3) as u8,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        let value = u64::from(self.id & 0x3ff)
            | (u64::from(self.sender & 0x3) << 10)
            | (u64::from(self.target & 0x3) << 12);
        put_varint(dst, value);
    }
}

/// Client login
#[derive(Debug, Clone, PartialEq)]
pub struct LoginPacket {
    pub protocol_version: i32,
    /// `{"chain": [jws, ..]}`
    pub chain: String,
    pub user_jws: String,
}

/// Block palette and item table announced when the world starts
#[derive(Debug, Clone, PartialEq)]
pub struct StartGamePacket {
    /// World settings preceding the palette, not interpreted
    pub settings: Bytes,
    pub blocks: Vec<BlockDefinition>,
    pub items: Vec<(String, i16)>,
    /// Everything after the item table, not interpreted
    pub trailer: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBlockPacket {
    pub x: i32,
    pub y: u32,
    pub z: i32,
    pub runtime_id: u32,
    pub flags: u32,
    pub layer: u32,
    /// Block key resolved through the installed registry
    pub block: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameBody {
    Login(LoginPacket),
    ServerToClientHandshake { jws: String },
    ClientToServerHandshake,
    StartGame(StartGamePacket),
    UpdateBlock(UpdateBlockPacket),
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GamePacket {
    pub header: GameHeader,
    pub body: GameBody,
}

impl GamePacket {
    pub fn login(packet: LoginPacket) -> Self {
        Self { header: GameHeader::new(LOGIN), body: GameBody::Login(packet) }
    }

    pub fn server_handshake(jws: String) -> Self {
        Self { header: GameHeader::new(SERVER_TO_CLIENT_HANDSHAKE), body: GameBody::ServerToClientHandshake { jws } }
    }

    pub fn client_handshake() -> Self {
        Self { header: GameHeader::new(CLIENT_TO_SERVER_HANDSHAKE), body: GameBody::ClientToServerHandshake }
    }

    pub fn start_game(packet: StartGamePacket) -> Self {
        Self { header: GameHeader::new(START_GAME), body: GameBody::StartGame(packet) }
    }
}

/// Update applied to a codec between frames
pub enum LegUpdate {
    Encrypt(Encryptor),
    Decrypt(Decryptor),
    Registry(Arc<TypeRegistry>),
}

impl std::fmt::Debug for LegUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegUpdate::Encrypt(_) => f.write_str("Encrypt"),
            LegUpdate::Decrypt(_) => f.write_str("Decrypt"),
            LegUpdate::Registry(r) => write!(f, "Registry({} states)", r.block_states.len()),
        }
    }
}

/// Item written to a game socket
#[derive(Debug)]
pub enum GameFrame {
    Batch(Vec<GamePacket>),
    /// Applied in order with the batches around it
    Update(LegUpdate),
}

// ---- primitive readers -------------------------------------------------

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProxyError::Codec(format!("truncated {}", what)));
    }
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_varint(buf)? as usize;
    need(buf, len, "string")?;
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|e| ProxyError::Codec(format!("invalid utf-8: {}", e)))
}

fn put_string(dst: &mut BytesMut, value: &str) {
    put_varint(dst, value.len() as u64);
    dst.put_slice(value.as_bytes());
}

fn get_le_string(buf: &mut Bytes) -> Result<String> {
    need(buf, 4, "length")?;
    let len = buf.get_u32_le() as usize;
    need(buf, len, "string")?;
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|e| ProxyError::Codec(format!("invalid utf-8: {}", e)))
}

fn zigzag(value: i32) -> u64 {
    u64::from(((value << 1) ^ (value >> 31)) as u32)
}

fn unzigzag(value: u64) -> i32 {
    let value = value as u32;
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

fn get_u32_varint(buf: &mut Bytes) -> Result<u32> {
    u32::try_from(get_varint(buf)?).map_err(|_| ProxyError::Codec("varint exceeds 32 bits".to_string()))
}

// ---- packet bodies ------------------------------------------------------

impl LoginPacket {
    fn decode(mut buf: Bytes) -> Result<Self> {
        need(&buf, 4, "protocol version")?;
        let protocol_version = buf.get_i32();
        let len = get_varint(&mut buf)? as usize;
        need(&buf, len, "connection request")?;
        let mut request = buf.split_to(len);
        let chain = get_le_string(&mut request)?;
        let user_jws = get_le_string(&mut request)?;
        Ok(Self { protocol_version, chain, user_jws })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32(self.protocol_version);
        let len = 8 + self.chain.len() + self.user_jws.len();
        put_varint(dst, len as u64);
        dst.put_u32_le(self.chain.len() as u32);
        dst.put_slice(self.chain.as_bytes());
        dst.put_u32_le(self.user_jws.len() as u32);
        dst.put_slice(self.user_jws.as_bytes());
    }
}

impl StartGamePacket {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let len = get_varint(&mut buf)? as usize;
        need(&buf, len, "world settings")?;
        let settings = buf.split_to(len);

        let block_count = get_varint(&mut buf)? as usize;
        let mut blocks = Vec::with_capacity(block_count.min(4096));
        for _ in 0..block_count {
            let key = get_string(&mut buf)?;
            let state_count = get_varint(&mut buf)? as usize;
            let mut states = Vec::with_capacity(state_count.min(4096));
            for _ in 0..state_count {
                let raw = get_string(&mut buf)?;
                states.push(serde_json::from_str(&raw)?);
            }
            blocks.push(BlockDefinition { key, states });
        }

        let item_count = get_varint(&mut buf)? as usize;
        let mut items = Vec::with_capacity(item_count.min(4096));
        for _ in 0..item_count {
            let key = get_string(&mut buf)?;
            need(&buf, 2, "item id")?;
            items.push((key, buf.get_i16_le()));
        }

        Ok(Self { settings, blocks, items, trailer: buf })
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        put_varint(dst, self.settings.len() as u64);
        dst.put_slice(&self.settings);
        put_varint(dst, self.blocks.len() as u64);
        for block in &self.blocks {
            put_string(dst, &block.key);
            put_varint(dst, block.states.len() as u64);
            for state in &block.states {
                put_string(dst, &serde_json::to_string(state)?);
            }
        }
        put_varint(dst, self.items.len() as u64);
        for (key, id) in &self.items {
            put_string(dst, key);
            dst.put_i16_le(*id);
        }
        dst.put_slice(&self.trailer);
        Ok(())
    }
}

impl UpdateBlockPacket {
    fn decode(mut buf: Bytes, registry: Option<&TypeRegistry>) -> Result<Self> {
        let x = unzigzag(get_varint(&mut buf)?);
        let y = get_u32_varint(&mut buf)?;
        let z = unzigzag(get_varint(&mut buf)?);
        let runtime_id = get_u32_varint(&mut buf)?;
        let flags = get_u32_varint(&mut buf)?;
        let layer = get_u32_varint(&mut buf)?;
        let block = registry
            .and_then(|r| r.block_state(runtime_id))
            .map(|state| state.key.clone());
        Ok(Self { x, y, z, runtime_id, flags, layer, block })
    }

    fn encode(&self, dst: &mut BytesMut) {
        put_varint(dst, zigzag(self.x));
        put_varint(dst, u64::from(self.y));
        put_varint(dst, zigzag(self.z));
        put_varint(dst, u64::from(self.runtime_id));
        put_varint(dst, u64::from(self.flags));
        put_varint(dst, u64::from(self.layer));
    }
}

fn decode_body(header: &GameHeader, payload: Bytes, registry: Option<&TypeRegistry>) -> Result<GameBody> {
    Ok(match header.id {
        LOGIN => GameBody::Login(LoginPacket::decode(payload)?),
        SERVER_TO_CLIENT_HANDSHAKE => {
            let mut buf = payload;
            GameBody::ServerToClientHandshake { jws: get_string(&mut buf)? }
        }
        CLIENT_TO_SERVER_HANDSHAKE => GameBody::ClientToServerHandshake,
        START_GAME => GameBody::StartGame(StartGamePacket::decode(payload)?),
        UPDATE_BLOCK => GameBody::UpdateBlock(UpdateBlockPacket::decode(payload, registry)?),
        _ => GameBody::Raw(payload),
    })
}

fn encode_body(body: &GameBody) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    match body {
        GameBody::Login(login) => login.encode(&mut dst),
        GameBody::ServerToClientHandshake { jws } => put_string(&mut dst, jws),
        GameBody::ClientToServerHandshake => {}
        GameBody::StartGame(start) => start.encode(&mut dst)?,
        GameBody::UpdateBlock(update) => update.encode(&mut dst),
        GameBody::Raw(bytes) => dst.put_slice(bytes),
    }
    Ok(dst.freeze())
}

/// Parse the packets of a plaintext batch
pub fn decode_batch(mut data: Bytes, registry: Option<&TypeRegistry>) -> Result<Vec<GamePacket>> {
    let mut packets = Vec::new();
    let mut frames = FrameCodec::<GameHeader>::new(PayloadMode::Remaining);
    while data.has_remaining() {
        let len = get_varint(&mut data)? as usize;
        need(&data, len, "packet")?;
        let mut packet = BytesMut::from(&data.split_to(len)[..]);
        let frame = frames
            .decode(&mut packet)?
            .ok_or_else(|| ProxyError::Codec("truncated packet header".to_string()))?;
        let body = decode_body(&frame.header, frame.payload, registry)?;
        packets.push(GamePacket { header: frame.header, body });
    }
    Ok(packets)
}

/// Serialize packets into a plaintext batch
pub fn encode_batch(packets: &[GamePacket]) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    let mut frames = FrameCodec::<GameHeader>::new(PayloadMode::Remaining);
    for packet in packets {
        let mut encoded = BytesMut::new();
        frames.encode(Frame { header: packet.header, payload: encode_body(&packet.body)? }, &mut encoded)?;
        put_varint(&mut dst, encoded.len() as u64);
        dst.put_slice(&encoded);
    }
    Ok(dst.freeze())
}

/// Codec for one direction of a game socket
#[derive(Default)]
pub struct GameCodec {
    frames: LengthDelimitedCodec,
    encryptor: Option<Encryptor>,
    decryptor: Option<Decryptor>,
    registry: Option<Arc<TypeRegistry>>,
    updates: Option<mpsc::UnboundedReceiver<LegUpdate>>,
}

impl GameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec plus the sender used to update it from another task
    pub fn with_updates() -> (Self, mpsc::UnboundedSender<LegUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { updates: Some(rx), ..Self::default() }, tx)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some() || self.decryptor.is_some()
    }

    pub fn registry(&self) -> Option<&TypeRegistry> {
        self.registry.as_deref()
    }

    fn apply(&mut self, update: LegUpdate) {
        trace!("Applying {:?}", update);
        match update {
            LegUpdate::Encrypt(encryptor) => self.encryptor = Some(encryptor),
            LegUpdate::Decrypt(decryptor) => self.decryptor = Some(decryptor),
            LegUpdate::Registry(registry) => self.registry = Some(registry),
        }
    }

    fn drain_updates(&mut self) {
        let mut pending = Vec::new();
        if let Some(updates) = self.updates.as_mut() {
            while let Ok(update) = updates.try_recv() {
                pending.push(update);
            }
        }
        for update in pending {
            self.apply(update);
        }
    }
}

impl Decoder for GameCodec {
    type Item = Vec<GamePacket>;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<GamePacket>>> {
        self.drain_updates();
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let batch = match self.decryptor.as_mut() {
            Some(decryptor) => decryptor.decrypt(&frame)?,
            None => frame.freeze(),
        };
        decode_batch(batch, self.registry.as_deref()).map(Some)
    }
}

impl Encoder<GameFrame> for GameCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: GameFrame, dst: &mut BytesMut) -> Result<()> {
        self.drain_updates();
        match item {
            GameFrame::Update(update) => {
                self.apply(update);
                Ok(())
            }
            GameFrame::Batch(packets) => {
                let batch = encode_batch(&packets)?;
                let batch = match self.encryptor.as_mut() {
                    Some(encryptor) => encryptor.encrypt(&batch)?,
                    None => batch,
                };
                self.frames.encode(batch, dst)?;
                Ok(())
            }
        }
    }
}
