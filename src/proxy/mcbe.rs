//! Game-network proxy
//!
//! Four codecs per connection: a reader and a writer on each leg. The client
//! side interceptor swaps the login for one vouching for the proxy's key; the
//! server side interceptor answers the server's key exchange, sets up a
//! separate exchange with the client, and installs the merged block registry
//! once the game starts. Keys and registries reach the codecs as
//! [`LegUpdate`] messages, never through shared state.

use std::sync::Arc;

use log::{debug, info, trace};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::common::{ProxyError, Result};
use crate::handshake::cipher::session as cipher_session;
use crate::handshake::palette::{self, BlockPalette};
use crate::handshake::{ClientIdentity, McbeHandshake, McbePhase};
use crate::protocol::game::{GameBody, GameCodec, GameFrame, GamePacket, LegUpdate};
use super::bridge::{Bridge, Interceptor};
use super::context::Session;
use super::event::{EventKind, EventSink};
use super::{blocking, handshake_deadline};

fn push(channel: &mpsc::UnboundedSender<LegUpdate>, update: LegUpdate) -> Result<()> {
    channel
        .send(update)
        .map_err(|_| ProxyError::Other("codec of the connection is gone".to_string()))
}

/// Client to server
struct ClientSide {
    handshake: Arc<McbeHandshake>,
    identity: Option<oneshot::Sender<ClientIdentity>>,
    peer: String,
    events: EventSink,
}

impl Interceptor<Vec<GamePacket>, GameFrame> for ClientSide {
    async fn intercept(&mut self, batch: Vec<GamePacket>) -> Result<Vec<GameFrame>> {
        let mut packets = Vec::with_capacity(batch.len());
        for packet in batch {
            match packet.body {
                GameBody::Login(login) if self.identity.is_some() => {
                    let handshake = Arc::clone(&self.handshake);
                    let (identity, rewritten) = blocking(move || handshake.rewrite_login(&login)).await?;
                    self.events.emit(EventKind::Handshake {
                        peer: self.peer.clone(),
                        phase: format!("{:?}", McbePhase::KeyExchange),
                    });
                    self.events.emit(EventKind::Authenticated {
                        peer: self.peer.clone(),
                        authenticated: identity.authenticated,
                    });
                    if let Some(tx) = self.identity.take() {
                        // the server side only needs it once the server answers
                        let _ = tx.send(identity);
                    }
                    packets.push(GamePacket { header: packet.header, body: GameBody::Login(rewritten) });
                }
                body => packets.push(GamePacket { header: packet.header, body }),
            }
        }
        Ok(vec![GameFrame::Batch(packets)])
    }
}

/// Server to client
struct ServerSide {
    handshake: Arc<McbeHandshake>,
    identity_rx: Option<oneshot::Receiver<ClientIdentity>>,
    identity: Option<ClientIdentity>,
    palette: Arc<BlockPalette>,
    client_read: mpsc::UnboundedSender<LegUpdate>,
    server_read: mpsc::UnboundedSender<LegUpdate>,
    server_write: mpsc::UnboundedSender<LegUpdate>,
    phase: watch::Sender<McbePhase>,
    peer: String,
    events: EventSink,
}

impl ServerSide {
    fn identity(&mut self) -> Result<&ClientIdentity> {
        if self.identity.is_none() {
            let received = self
                .identity_rx
                .take()
                .and_then(|mut rx| rx.try_recv().ok())
                .ok_or_else(|| ProxyError::Handshake("server handshake before client login".to_string()))?;
            self.identity = Some(received);
        }
        self.identity
            .as_ref()
            .ok_or_else(|| ProxyError::Handshake("client identity missing".to_string()))
    }

    /// Install both legs' ciphers and return what the client must be sent
    async fn exchange(&mut self, server_token: String) -> Result<Vec<GameFrame>> {
        let identity = self.identity()?.clone();
        let handshake = Arc::clone(&self.handshake);
        let keys = blocking(move || handshake.exchange(&server_token, &identity)).await?;

        let (server_encryptor, server_decryptor) = cipher_session(keys.server_key)?;
        let (client_encryptor, client_decryptor) = cipher_session(keys.client_key)?;
        push(&self.server_read, LegUpdate::Decrypt(server_decryptor))?;
        push(&self.server_write, LegUpdate::Encrypt(server_encryptor))?;
        push(&self.client_read, LegUpdate::Decrypt(client_decryptor))?;

        self.phase.send_replace(McbePhase::Encrypted);
        info!("{} both legs encrypted", self.peer);
        self.events.emit(EventKind::Handshake {
            peer: self.peer.clone(),
            phase: format!("{:?}", McbePhase::Encrypted),
        });
        Ok(vec![
            GameFrame::Batch(vec![GamePacket::server_handshake(keys.client_token)]),
            GameFrame::Update(LegUpdate::Encrypt(client_encryptor)),
        ])
    }

    fn install_registry(&mut self, blocks: &[palette::BlockDefinition], items: &[(String, i16)]) -> Result<()> {
        let version = self.identity()?.protocol_version;
        let registry = Arc::new(palette::merge(&self.palette, blocks, items, version));
        debug!(
            "{} block registry of {} states for protocol {}",
            self.peer,
            registry.block_states.len(),
            version
        );
        push(&self.client_read, LegUpdate::Registry(Arc::clone(&registry)))?;
        push(&self.server_read, LegUpdate::Registry(registry))
    }
}

impl Interceptor<Vec<GamePacket>, GameFrame> for ServerSide {
    async fn intercept(&mut self, batch: Vec<GamePacket>) -> Result<Vec<GameFrame>> {
        let mut frames = Vec::new();
        let mut packets = Vec::with_capacity(batch.len());
        for packet in batch {
            match &packet.body {
                GameBody::ServerToClientHandshake { jws } => {
                    let jws = jws.clone();
                    if !packets.is_empty() {
                        frames.push(GameFrame::Batch(std::mem::take(&mut packets)));
                    }
                    frames.extend(self.exchange(jws).await?);
                }
                GameBody::StartGame(start) => {
                    self.install_registry(&start.blocks, &start.items)?;
                    packets.push(packet);
                }
                GameBody::UpdateBlock(update) => {
                    trace!("{} block at {},{},{} is {:?}", self.peer, update.x, update.y, update.z, update.block);
                    packets.push(packet);
                }
                _ => packets.push(packet),
            }
        }
        if !packets.is_empty() {
            frames.push(GameFrame::Batch(packets));
        }
        Ok(frames)
    }
}

pub(crate) async fn handle(stream: TcpStream, session: &Session) -> Result<()> {
    let handshake = Arc::new(blocking(McbeHandshake::new).await?);
    let peer = session.peer.to_string();

    let (client_reader, client_writer) = stream.into_split();
    let (client_read_codec, client_read) = GameCodec::with_updates();
    let (server_read_codec, server_read) = GameCodec::with_updates();
    let (server_write_codec, server_write) = GameCodec::with_updates();
    let (identity_tx, identity_rx) = oneshot::channel();
    let (phase, phase_rx) = watch::channel(McbePhase::Login);

    let outbound = ClientSide {
        handshake: Arc::clone(&handshake),
        identity: Some(identity_tx),
        peer: peer.clone(),
        events: session.events.clone(),
    };
    let inbound = ServerSide {
        handshake,
        identity_rx: Some(identity_rx),
        identity: None,
        palette: Arc::clone(&session.context.palette),
        client_read,
        server_read,
        server_write,
        phase,
        peer,
        events: session.events.clone(),
    };

    let connect = async move {
        let (upstream, target, _) = session.connect(Value::Null).await?;
        info!("{} relaying game session to {}", session.label, target);
        session.events.emit(EventKind::Connected { peer: session.peer.to_string(), target: target.to_string() });
        let (reader, writer) = upstream.into_split();
        Ok((FramedRead::new(reader, server_read_codec), FramedWrite::new(writer, server_write_codec)))
    };

    let bridge = Bridge::new(session.label.as_str(), outbound, inbound).run(
        FramedRead::new(client_reader, client_read_codec),
        FramedWrite::new(client_writer, GameCodec::new()),
        connect,
    );
    tokio::select! {
        result = bridge => result,
        error = handshake_deadline(phase_rx, McbePhase::Encrypted, session.settings().handshake_timeout) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::jwt;
    use crate::handshake::mcbe::tests::client_login;
    use crate::protocol::game::StartGamePacket;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Legs {
        client: ClientSide,
        server: ServerSide,
        client_read: mpsc::UnboundedReceiver<LegUpdate>,
        server_read: mpsc::UnboundedReceiver<LegUpdate>,
        server_write: mpsc::UnboundedReceiver<LegUpdate>,
        phase: watch::Receiver<McbePhase>,
    }

    fn legs() -> Legs {
        let (tx, _) = broadcast::channel(16);
        let events = EventSink::new("mcbe", tx);
        let handshake = Arc::new(McbeHandshake::new().unwrap());
        let (identity_tx, identity_rx) = oneshot::channel();
        let (client_read_tx, client_read) = mpsc::unbounded_channel();
        let (server_read_tx, server_read) = mpsc::unbounded_channel();
        let (server_write_tx, server_write) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(McbePhase::Login);
        Legs {
            client: ClientSide {
                handshake: Arc::clone(&handshake),
                identity: Some(identity_tx),
                peer: "peer".to_string(),
                events: events.clone(),
            },
            server: ServerSide {
                handshake,
                identity_rx: Some(identity_rx),
                identity: None,
                palette: Arc::new(BlockPalette::default()),
                client_read: client_read_tx,
                server_read: server_read_tx,
                server_write: server_write_tx,
                phase: phase_tx,
                peer: "peer".to_string(),
                events,
            },
            client_read,
            server_read,
            server_write,
            phase,
        }
    }

    fn batch(frames: Vec<GameFrame>) -> Vec<GamePacket> {
        match frames.into_iter().next() {
            Some(GameFrame::Batch(packets)) => packets,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_is_rewritten() {
        let mut legs = legs();
        let client_key = jwt::generate_key().unwrap();
        let login = client_login(&client_key);
        let out = batch(legs.client.intercept(vec![GamePacket::login(login.clone())]).await.unwrap());

        match &out[0].body {
            GameBody::Login(rewritten) => {
                assert_eq!(rewritten.protocol_version, login.protocol_version);
                assert_ne!(rewritten.chain, login.chain);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(legs.client.identity.is_none());
    }

    #[tokio::test]
    async fn test_server_handshake_splits_the_legs() {
        let mut legs = legs();
        let client_key = jwt::generate_key().unwrap();
        legs.client.intercept(vec![GamePacket::login(client_login(&client_key))]).await.unwrap();

        let server_key = jwt::generate_key().unwrap();
        let token = jwt::sign(&server_key, &json!({"salt": STANDARD.encode(b"0123456789abcdef")})).unwrap();
        let frames = legs.server.intercept(vec![GamePacket::server_handshake(token.clone())]).await.unwrap();

        assert_eq!(frames.len(), 2);
        match &frames[0] {
            GameFrame::Batch(packets) => match &packets[0].body {
                GameBody::ServerToClientHandshake { jws } => assert_ne!(jws, &token),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(frames[1], GameFrame::Update(LegUpdate::Encrypt(_))));
        assert!(matches!(legs.server_read.try_recv(), Ok(LegUpdate::Decrypt(_))));
        assert!(matches!(legs.server_write.try_recv(), Ok(LegUpdate::Encrypt(_))));
        assert!(matches!(legs.client_read.try_recv(), Ok(LegUpdate::Decrypt(_))));
        assert_eq!(*legs.phase.borrow(), McbePhase::Encrypted);
    }

    #[tokio::test]
    async fn test_handshake_before_login_fails() {
        let mut legs = legs();
        let token = jwt::sign(&jwt::generate_key().unwrap(), &json!({"salt": "AA=="})).unwrap();
        let result = legs.server.intercept(vec![GamePacket::server_handshake(token)]).await;
        assert!(matches!(result, Err(ProxyError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_start_game_installs_registry() {
        let mut legs = legs();
        let client_key = jwt::generate_key().unwrap();
        legs.client.intercept(vec![GamePacket::login(client_login(&client_key))]).await.unwrap();

        let start = StartGamePacket {
            settings: Bytes::from_static(b"\x00"),
            blocks: vec![palette::BlockDefinition { key: "custom:ore".to_string(), states: vec![json!({})] }],
            items: vec![("custom:pick".to_string(), 900)],
            trailer: Bytes::new(),
        };
        let out = batch(legs.server.intercept(vec![GamePacket::start_game(start)]).await.unwrap());
        assert_eq!(out.len(), 1);

        for channel in [&mut legs.client_read, &mut legs.server_read] {
            match channel.try_recv() {
                Ok(LegUpdate::Registry(registry)) => {
                    assert_eq!(registry.block_states[0].key, "custom:ore");
                    assert_eq!(registry.item(900), Some("custom:pick"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_forged_login_is_refused() {
        let mut legs = legs();
        let mut login = client_login(&jwt::generate_key().unwrap());
        login.user_jws = jwt::sign(&jwt::generate_key().unwrap(), &json!({"DisplayName": "mallory"})).unwrap();

        let result = legs.client.intercept(vec![GamePacket::login(login)]).await;
        assert!(result.is_err());
        // nothing reaches the server leg
        assert!(legs.client.identity.is_some());
    }
}
